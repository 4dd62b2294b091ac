//! Polling relay through a shared store
//!
//! The initiator writes its offer under `p2p_offer` and polls `p2p_answer`;
//! the responder does the opposite. There is no push notification, so the
//! waiting side runs a [`RelayPoller`]: a spawned task that polls on a fixed
//! interval, hands back the first value it sees and stops. The channel
//! itself returns a value at most once, so later polls can never feed the
//! same descriptor into a session twice.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::core::negotiator::Role;
use crate::signaling::channel::{DeliveryHandle, OutOfBandChannel};
use crate::signaling::codec::EncodedSignal;
use crate::signaling::store::SharedStore;

pub const OFFER_KEY: &str = "p2p_offer";
pub const ANSWER_KEY: &str = "p2p_answer";

/// Default polling interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct PollingRelayChannel {
    store: Arc<dyn SharedStore>,
    outgoing_key: &'static str,
    incoming_key: &'static str,
    consumed: bool,
}

impl PollingRelayChannel {
    pub fn new(store: Arc<dyn SharedStore>, role: Role) -> Self {
        let (outgoing_key, incoming_key) = match role {
            Role::Initiator => (OFFER_KEY, ANSWER_KEY),
            Role::Responder => (ANSWER_KEY, OFFER_KEY),
        };
        Self {
            store,
            outgoing_key,
            incoming_key,
            consumed: false,
        }
    }

    /// Remove both relay keys. Stale values from an earlier handshake would
    /// otherwise be picked up by the next poll.
    pub fn clear(&self) -> Result<()> {
        self.store.remove(OFFER_KEY)?;
        self.store.remove(ANSWER_KEY)?;
        log::debug!("Cleared relay keys");
        Ok(())
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }
}

#[async_trait]
impl OutOfBandChannel for PollingRelayChannel {
    async fn deliver(&mut self, signal: &EncodedSignal) -> Result<DeliveryHandle> {
        self.store
            .set(self.outgoing_key, signal.as_str())
            .with_context(|| format!("Failed to write {}", self.outgoing_key))?;
        log::debug!("Wrote signal to relay key {}", self.outgoing_key);
        Ok(DeliveryHandle::Stored {
            key: self.outgoing_key.to_string(),
        })
    }

    async fn poll(&mut self) -> Result<Option<EncodedSignal>> {
        if self.consumed {
            return Ok(None);
        }

        match self.store.get(self.incoming_key)? {
            Some(value) if !value.trim().is_empty() => {
                self.consumed = true;
                log::debug!("Found signal under relay key {}", self.incoming_key);
                Ok(Some(EncodedSignal::new(value.trim())))
            }
            _ => Ok(None),
        }
    }
}

/// Cancellable periodic poll of an out-of-band channel.
///
/// The task owns the channel while polling and hands it back together with
/// the first signal. Dropping the poller cancels the task.
pub struct RelayPoller<C> {
    result_rx: oneshot::Receiver<(C, EncodedSignal)>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl<C> RelayPoller<C>
where
    C: OutOfBandChannel + 'static,
{
    pub fn spawn(mut channel: C, period: Duration) -> Self {
        let (result_tx, result_rx) = oneshot::channel();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        log::debug!("Relay poller cancelled");
                        return;
                    }
                    _ = ticker.tick() => {
                        match channel.poll().await {
                            Ok(Some(signal)) => {
                                let _ = result_tx.send((channel, signal));
                                return;
                            }
                            Ok(None) => {}
                            Err(e) => log::warn!("Relay poll failed: {:#}", e),
                        }
                    }
                }
            }
        });

        Self {
            result_rx,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// Wait for the first signal. The poller is finished afterwards.
    pub async fn recv(&mut self) -> Result<(C, EncodedSignal)> {
        let result = (&mut self.result_rx)
            .await
            .context("Relay poller stopped before a signal arrived");
        self.shutdown_tx.take();
        result
    }

    pub fn cancel(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.task.abort();
    }
}

impl<C> Drop for RelayPoller<C> {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::store::MemoryStore;

    const TICK: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn test_poll_returns_value_only_once() {
        let store = Arc::new(MemoryStore::new());
        let mut responder = PollingRelayChannel::new(store.clone(), Role::Responder);

        assert_eq!(responder.poll().await.unwrap(), None);

        store.set(OFFER_KEY, "token").unwrap();
        assert_eq!(
            responder.poll().await.unwrap(),
            Some(EncodedSignal::new("token"))
        );
        assert!(responder.is_consumed());

        // Still present in the store, but never handed out again.
        assert_eq!(responder.poll().await.unwrap(), None);
        store.set(OFFER_KEY, "newer").unwrap();
        assert_eq!(responder.poll().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_follow_role() {
        let store = Arc::new(MemoryStore::new());
        let mut initiator = PollingRelayChannel::new(store.clone(), Role::Initiator);
        let mut responder = PollingRelayChannel::new(store.clone(), Role::Responder);

        let handle = initiator.deliver(&EncodedSignal::new("offer")).await.unwrap();
        assert_eq!(handle, DeliveryHandle::Stored { key: OFFER_KEY.to_string() });
        responder.deliver(&EncodedSignal::new("answer")).await.unwrap();

        assert_eq!(store.get(OFFER_KEY).unwrap().as_deref(), Some("offer"));
        assert_eq!(store.get(ANSWER_KEY).unwrap().as_deref(), Some("answer"));
        assert_eq!(initiator.poll().await.unwrap(), Some(EncodedSignal::new("answer")));
    }

    #[tokio::test]
    async fn test_clear_removes_stale_values() {
        let store = Arc::new(MemoryStore::new());
        store.set(OFFER_KEY, "stale offer").unwrap();
        store.set(ANSWER_KEY, "stale answer").unwrap();

        let mut initiator = PollingRelayChannel::new(store.clone(), Role::Initiator);
        initiator.clear().unwrap();
        assert_eq!(initiator.poll().await.unwrap(), None);
        assert_eq!(store.get(OFFER_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_poller_yields_value_written_later() {
        let store = Arc::new(MemoryStore::new());
        let channel = PollingRelayChannel::new(store.clone(), Role::Initiator);
        let mut poller = RelayPoller::spawn(channel, TICK);

        tokio::time::sleep(TICK * 3).await;
        store.set(ANSWER_KEY, "late answer").unwrap();

        let (channel, signal) = tokio::time::timeout(Duration::from_secs(2), poller.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal, EncodedSignal::new("late answer"));
        assert!(channel.is_consumed());
    }

    #[tokio::test]
    async fn test_cancelled_poller_reports_no_signal() {
        let store = Arc::new(MemoryStore::new());
        let channel = PollingRelayChannel::new(store.clone(), Role::Responder);
        let mut poller = RelayPoller::spawn(channel, TICK);

        poller.cancel();
        store.set(OFFER_KEY, "too late").unwrap();

        assert!(poller.recv().await.is_err());
        // Nobody consumed the value.
        assert_eq!(store.get(OFFER_KEY).unwrap().as_deref(), Some("too late"));
    }
}
