//! In-process transport
//!
//! Pairs transports created by the same [`LoopbackFactory`]. Descriptors
//! carry the id of the transport that produced them, so a full
//! offer/answer exchange through any out-of-band channel connects the two
//! sides exactly like a real peer connection would. Used by the test suite
//! and for exercising the signaling paths without network access.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use super::{
    DescriptorRejected, Transport, TransportEvent, TransportEvents, TransportFactory,
    TransportOptions, EVENT_CHANNEL_CAPACITY,
};
use crate::signaling::codec::SignalingDescriptor;

const OFFER_PREFIX: &str = "loopback-offer:";
const ANSWER_PREFIX: &str = "loopback-answer:";

struct PeerSlot {
    events: mpsc::Sender<TransportEvent>,
    remote: Option<u64>,
    connected: bool,
}

#[derive(Default)]
struct Hub {
    next_id: u64,
    peers: HashMap<u64, PeerSlot>,
}

/// Factory whose transports can only reach each other.
#[derive(Clone, Default)]
pub struct LoopbackFactory {
    hub: Arc<Mutex<Hub>>,
    messages_sent: Arc<AtomicUsize>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages handed to any transport of this factory.
    pub fn messages_sent(&self) -> usize {
        self.messages_sent.load(Ordering::SeqCst)
    }

    /// Number of transports created and not yet closed.
    pub fn open_transports(&self) -> usize {
        self.hub().peers.len()
    }

    /// Report a negotiation failure on every open transport.
    pub fn inject_failure(&self, reason: &str) {
        let senders: Vec<_> = self.hub().peers.values().map(|p| p.events.clone()).collect();
        for tx in senders {
            if tx.try_send(TransportEvent::Error(reason.to_string())).is_err() {
                log::warn!("Failed to deliver injected failure - receiver dropped");
            }
        }
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(
        &self,
        options: TransportOptions,
    ) -> Result<(Arc<dyn Transport>, TransportEvents)> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let id = {
            let mut hub = self.hub();
            hub.next_id += 1;
            let id = hub.next_id;
            hub.peers.insert(
                id,
                PeerSlot {
                    events: events_tx.clone(),
                    remote: None,
                    connected: false,
                },
            );
            id
        };

        if options.initiator {
            let offer = SignalingDescriptor::offer(format!("{}{}", OFFER_PREFIX, id));
            events_tx
                .send(TransportEvent::Signal(offer))
                .await
                .context("Event receiver dropped before offer was ready")?;
        }

        log::debug!("Created loopback transport {} (initiator: {})", id, options.initiator);

        let transport = LoopbackTransport {
            id,
            initiator: options.initiator,
            factory: self.clone(),
        };
        Ok((Arc::new(transport), events_rx))
    }
}

pub struct LoopbackTransport {
    id: u64,
    initiator: bool,
    factory: LoopbackFactory,
}

fn parse_peer_id(sdp: &str, prefix: &str) -> Result<u64, DescriptorRejected> {
    let id = sdp.strip_prefix(prefix).ok_or_else(|| {
        DescriptorRejected(format!("Not a loopback descriptor (expected '{}')", prefix))
    })?;
    id.parse()
        .map_err(|e| DescriptorRejected(format!("Invalid loopback peer id: {}", e)))
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn signal(&self, descriptor: SignalingDescriptor) -> Result<()> {
        if self.initiator {
            let peer = parse_peer_id(&descriptor.sdp, ANSWER_PREFIX)?;
            let notify = {
                let mut hub = self.factory.hub();
                if !hub.peers.contains_key(&peer) {
                    anyhow::bail!("Unknown loopback peer {}", peer);
                }
                if !hub.peers.contains_key(&self.id) {
                    anyhow::bail!("Transport already closed");
                }
                let mut notify = Vec::with_capacity(2);
                for (local, remote) in [(self.id, peer), (peer, self.id)] {
                    if let Some(slot) = hub.peers.get_mut(&local) {
                        slot.remote = Some(remote);
                        slot.connected = true;
                        notify.push(slot.events.clone());
                    }
                }
                notify
            };
            for tx in notify {
                if tx.send(TransportEvent::Connect).await.is_err() {
                    log::warn!("Failed to deliver connect event - receiver dropped");
                }
            }
        } else {
            let peer = parse_peer_id(&descriptor.sdp, OFFER_PREFIX)?;
            let events = {
                let mut hub = self.factory.hub();
                if !hub.peers.contains_key(&peer) {
                    anyhow::bail!("Unknown loopback peer {}", peer);
                }
                let slot = hub
                    .peers
                    .get_mut(&self.id)
                    .context("Transport already closed")?;
                slot.remote = Some(peer);
                slot.events.clone()
            };
            let answer = SignalingDescriptor::answer(format!("{}{}", ANSWER_PREFIX, self.id));
            events
                .send(TransportEvent::Signal(answer))
                .await
                .context("Event receiver dropped before answer was ready")?;
        }
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let remote_events = {
            let hub = self.factory.hub();
            let slot = hub.peers.get(&self.id).context("Transport already closed")?;
            if !slot.connected {
                anyhow::bail!("Loopback transport is not connected");
            }
            let remote = slot.remote.context("Loopback transport has no peer")?;
            hub.peers
                .get(&remote)
                .map(|peer| peer.events.clone())
                .context("Peer transport closed")?
        };

        remote_events
            .send(TransportEvent::Data(data))
            .await
            .map_err(|_| anyhow::anyhow!("Peer stopped receiving"))?;
        self.factory.messages_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.factory
            .hub()
            .peers
            .get(&self.id)
            .map(|slot| slot.connected)
            .unwrap_or(false)
    }

    async fn close(&self) -> Result<()> {
        let notify = {
            let mut hub = self.factory.hub();
            let Some(slot) = hub.peers.remove(&self.id) else {
                return Ok(());
            };
            match slot.remote {
                Some(remote) if slot.connected => hub.peers.get_mut(&remote).map(|peer| {
                    peer.connected = false;
                    peer.events.clone()
                }),
                _ => None,
            }
        };

        if let Some(tx) = notify {
            let _ = tx.send(TransportEvent::Close).await;
        }
        log::debug!("Closed loopback transport {}", self.id);
        Ok(())
    }
}
