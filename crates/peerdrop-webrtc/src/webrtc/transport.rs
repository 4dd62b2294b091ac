//! WebRTC transport
//!
//! Implements the transport capability on top of [`WebRtcPeer`]. The
//! initiator opens the `file-transfer` data channel and publishes its offer
//! once ICE gathering is done; the responder publishes its answer after the
//! offer was signalled in. Peer callbacks only hold weak references and
//! never keep the transport alive on their own.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use peerdrop_common::signaling::codec::{SignalKind, SignalingDescriptor};
use peerdrop_common::transport::{
    DescriptorRejected, Transport, TransportEvent, TransportEvents, TransportFactory,
    TransportOptions, EVENT_CHANNEL_CAPACITY,
};

use super::common::{
    ice_candidates_to_payloads, IceGathering, WebRtcPeer, ICE_GATHERING_TIMEOUT,
};
use super::framing::{split_message, MessageAssembler, MAX_FRAME_PAYLOAD};

/// Label of the single data channel
pub const DATA_CHANNEL_LABEL: &str = "file-transfer";

/// Pause sending while this much data is queued in the channel (1MB)
const BUFFERED_AMOUNT_HIGH: usize = 1024 * 1024;

const SEND_BACKOFF: Duration = Duration::from_millis(10);

/// Creates one WebRTC peer connection per session.
#[derive(Debug, Clone)]
pub struct WebRtcTransportFactory {
    ice_gathering_timeout: Duration,
}

impl Default for WebRtcTransportFactory {
    fn default() -> Self {
        Self {
            ice_gathering_timeout: ICE_GATHERING_TIMEOUT,
        }
    }
}

impl WebRtcTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap on local candidate gathering before a descriptor is published.
    pub fn with_ice_gathering_timeout(mut self, timeout: Duration) -> Self {
        self.ice_gathering_timeout = timeout;
        self
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        options: TransportOptions,
    ) -> Result<(Arc<dyn Transport>, TransportEvents)> {
        if options.trickle {
            anyhow::bail!("Trickle ICE is not supported: descriptors must carry every candidate");
        }

        let (peer, streams) = WebRtcPeer::new().await?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let transport = Arc::new(WebRtcTransport {
            shared: Arc::new(Shared {
                peer,
                events: events_tx,
                channel: Mutex::new(None),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            initiator: options.initiator,
            gathering: Mutex::new(Some(streams.gathering)),
            ice_gathering_timeout: self.ice_gathering_timeout,
            remote_applied: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        transport.watch_connection_state(streams.state);

        if options.initiator {
            let dc = transport
                .shared
                .peer
                .create_data_channel(DATA_CHANNEL_LABEL)
                .await?;
            attach_data_channel(&transport.shared, dc);

            let offer = transport.shared.peer.create_local_offer().await?;
            transport.publish_local_descriptor(SignalKind::Offer, offer.sdp)?;
        } else {
            transport.accept_data_channel(streams.data_channels);
        }

        Ok((transport, events_rx))
    }
}

/// State reachable from peer callbacks.
struct Shared {
    peer: WebRtcPeer,
    events: mpsc::Sender<TransportEvent>,
    channel: Mutex<Option<Arc<RTCDataChannel>>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            log::debug!("Transport event dropped - session is gone");
        }
    }

    fn channel(&self) -> MutexGuard<'_, Option<Arc<RTCDataChannel>>> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WebRtcTransport {
    shared: Arc<Shared>,
    initiator: bool,
    gathering: Mutex<Option<IceGathering>>,
    ice_gathering_timeout: Duration,
    remote_applied: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebRtcTransport {
    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Gather candidates in the background, then emit the descriptor.
    fn publish_local_descriptor(&self, kind: SignalKind, sdp: String) -> Result<()> {
        let gathering = self
            .gathering
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .context("ICE gathering already consumed")?;
        let shared = Arc::downgrade(&self.shared);
        let timeout = self.ice_gathering_timeout;

        self.track(tokio::spawn(async move {
            eprintln!("Gathering connection info...");
            let candidates = gathering.wait(timeout).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };

            if candidates.is_empty() {
                shared
                    .emit(TransportEvent::Error(
                        "No ICE candidates gathered. Check your network connection.".to_string(),
                    ))
                    .await;
                return;
            }
            log::info!("Collected {} ICE candidates", candidates.len());

            let descriptor = match kind {
                SignalKind::Offer => SignalingDescriptor::offer(sdp),
                SignalKind::Answer => SignalingDescriptor::answer(sdp),
            }
            .with_candidates(ice_candidates_to_payloads(candidates));
            shared.emit(TransportEvent::Signal(descriptor)).await;
        }));
        Ok(())
    }

    /// Responder side: wait for the initiator's data channel.
    fn accept_data_channel(&self, mut data_channels: mpsc::Receiver<Arc<RTCDataChannel>>) {
        let shared = Arc::downgrade(&self.shared);
        self.track(tokio::spawn(async move {
            let Some(dc) = data_channels.recv().await else {
                return;
            };
            if let Some(shared) = shared.upgrade() {
                log::debug!("Remote opened data channel '{}'", dc.label());
                attach_data_channel(&shared, dc);
            }
        }));
    }

    fn watch_connection_state(&self, mut state_rx: watch::Receiver<RTCPeerConnectionState>) {
        let shared = Arc::downgrade(&self.shared);
        self.track(tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow();
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                match state {
                    RTCPeerConnectionState::Failed => {
                        shared.connected.store(false, Ordering::SeqCst);
                        shared
                            .emit(TransportEvent::Error(
                                "WebRTC connection failed. NAT traversal may have failed."
                                    .to_string(),
                            ))
                            .await;
                        return;
                    }
                    RTCPeerConnectionState::Disconnected => {
                        log::warn!("WebRTC connection disconnected");
                    }
                    RTCPeerConnectionState::Closed => {
                        shared.connected.store(false, Ordering::SeqCst);
                        shared.emit(TransportEvent::Close).await;
                        return;
                    }
                    _ => {}
                }
            }
        }));
    }
}

/// Wire a data channel's callbacks to the transport events.
fn attach_data_channel(shared: &Arc<Shared>, dc: Arc<RTCDataChannel>) {
    let label = dc.label().to_string();

    *shared.channel() = Some(dc.clone());

    let weak = Arc::downgrade(shared);
    let open_label = label.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            log::debug!("Data channel '{}' opened", open_label);
            shared.connected.store(true, Ordering::SeqCst);

            let info = shared.peer.get_connection_info().await;
            eprintln!("WebRTC connection established!");
            eprintln!("   Connection: {}", info.connection_type);
            if let (Some(local), Some(remote)) = (&info.local_address, &info.remote_address) {
                eprintln!("   Local: {} -> Remote: {}", local, remote);
            }

            shared.emit(TransportEvent::Connect).await;
        })
    }));

    let weak = Arc::downgrade(shared);
    let mut assembler = MessageAssembler::new();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let result = assembler.push(&msg.data);
        let weak = weak.clone();
        Box::pin(async move {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(Some(message)) => shared.emit(TransportEvent::Data(message)).await,
                Ok(None) => {}
                Err(e) => shared.emit(TransportEvent::Error(format!("{:#}", e))).await,
            }
        })
    }));

    let weak = Arc::downgrade(shared);
    let error_label = label.clone();
    dc.on_error(Box::new(move |err| {
        let weak = weak.clone();
        let reason = format!("Data channel '{}' error: {}", error_label, err);
        Box::pin(async move {
            log::error!("{}", reason);
            if let Some(shared) = weak.upgrade() {
                shared.emit(TransportEvent::Error(reason)).await;
            }
        })
    }));

    let weak = Arc::downgrade(shared);
    dc.on_close(Box::new(move || {
        let weak = weak.clone();
        let label = label.clone();
        Box::pin(async move {
            log::debug!("Data channel '{}' closed", label);
            if let Some(shared) = weak.upgrade() {
                shared.connected.store(false, Ordering::SeqCst);
                shared.emit(TransportEvent::Close).await;
            }
        })
    }));
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn signal(&self, descriptor: SignalingDescriptor) -> Result<()> {
        if self.remote_applied.swap(true, Ordering::SeqCst) {
            anyhow::bail!("Remote description already set");
        }

        match (self.initiator, descriptor.kind) {
            (true, SignalKind::Answer) => {
                let applied = match RTCSessionDescription::answer(descriptor.sdp) {
                    Ok(answer) => self.shared.peer.set_remote_description(answer).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = applied {
                    // Nothing was applied, a corrected answer may follow
                    self.remote_applied.store(false, Ordering::SeqCst);
                    let reason = format!("Unusable answer SDP: {:#}", e);
                    return Err(DescriptorRejected(reason).into());
                }
                self.shared
                    .peer
                    .add_remote_candidates(&descriptor.candidates)
                    .await?;
                eprintln!("Connecting...");
            }
            (false, SignalKind::Offer) => {
                let applied = match RTCSessionDescription::offer(descriptor.sdp) {
                    Ok(offer) => self.shared.peer.set_remote_description(offer).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = applied {
                    let reason = format!("Unusable offer SDP: {:#}", e);
                    return Err(DescriptorRejected(reason).into());
                }
                self.shared
                    .peer
                    .add_remote_candidates(&descriptor.candidates)
                    .await?;

                let answer = self.shared.peer.create_local_answer().await?;
                self.publish_local_descriptor(SignalKind::Answer, answer.sdp)?;
            }
            (initiator, kind) => {
                let role = if initiator { "initiator" } else { "responder" };
                anyhow::bail!("The {} cannot accept an {}", role, kind);
            }
        }
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_connected() {
            anyhow::bail!("Data channel is not open");
        }
        let dc = self
            .shared
            .channel()
            .clone()
            .context("Data channel already released")?;

        for frame in split_message(&data, MAX_FRAME_PAYLOAD) {
            while dc.buffered_amount().await > BUFFERED_AMOUNT_HIGH {
                tokio::time::sleep(SEND_BACKOFF).await;
            }
            dc.send(&frame)
                .await
                .context("Failed to send data channel frame")?;
        }
        log::debug!("Sent message ({} bytes)", data.len());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.connected.store(false, Ordering::SeqCst);

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        let channel = self.shared.channel().take();
        if let Some(dc) = channel {
            if let Err(e) = dc.close().await {
                log::debug!("Failed to close data channel: {}", e);
            }
        }
        self.shared.peer.close().await
    }
}
