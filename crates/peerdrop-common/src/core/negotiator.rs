//! Two-role handshake on top of a [`TransportFactory`].
//!
//! ```text
//!  Initiator                                   Responder
//!  ---------                                   ---------
//!  begin_initiator()            Idle
//!  local_descriptor().await ->  offer ------>  begin_responder(offer)
//!                               AwaitingRemote local_descriptor().await
//!  apply_remote_descriptor() <- answer <-----  (LocalDescriptionReady)
//!  wait_connected()             Connected      wait_connected()
//! ```
//!
//! Exactly two descriptors are exchanged. Trickle ICE is disabled, so each
//! descriptor already carries every candidate and no further signaling is
//! needed once the answer has been applied.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::error::SessionError;
use crate::signaling::codec::{SignalKind, SignalingDescriptor};
use crate::transport::{
    DescriptorRejected, Transport, TransportEvent, TransportEvents, TransportFactory,
    TransportOptions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// Kind of descriptor this role produces.
    pub fn local_kind(self) -> SignalKind {
        match self {
            Role::Initiator => SignalKind::Offer,
            Role::Responder => SignalKind::Answer,
        }
    }

    /// Kind of descriptor this role expects from its peer.
    pub fn remote_kind(self) -> SignalKind {
        match self {
            Role::Initiator => SignalKind::Answer,
            Role::Responder => SignalKind::Offer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    LocalDescriptionReady,
    AwaitingRemoteDescriptor,
    Connected,
    /// Terminal. A new session is needed to retry.
    Failed,
}

/// Hands out sessions, one at a time.
pub struct ConnectionNegotiator {
    factory: Arc<dyn TransportFactory>,
    active: Arc<AtomicBool>,
}

/// Clears the negotiator's active flag when the session lets go of it.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ConnectionNegotiator {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True while a session from this negotiator is alive and not closed.
    pub fn has_active_session(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> Result<ActiveGuard, SessionError> {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ActiveGuard(self.active.clone()))
            .map_err(|_| SessionError::SessionActive)
    }

    /// Start an initiator session. Returns in `Idle`; the offer arrives
    /// through [`Session::local_descriptor`].
    pub async fn begin_initiator(&self) -> Result<Session, SessionError> {
        let guard = self.acquire()?;
        let (transport, events) = self
            .factory
            .create(TransportOptions::initiator())
            .await
            .map_err(|e| SessionError::transport(format!("{:#}", e)))?;

        log::debug!("Started initiator session");
        Ok(Session::new(Role::Initiator, transport, events, guard))
    }

    /// Start a responder session from the peer's offer. The offer is applied
    /// immediately; the answer arrives through [`Session::local_descriptor`].
    pub async fn begin_responder(&self, offer: SignalingDescriptor) -> Result<Session, SessionError> {
        if offer.kind != SignalKind::Offer {
            return Err(SessionError::InvalidDescriptor(format!(
                "responder needs an offer, got an {}",
                offer.kind
            )));
        }

        let guard = self.acquire()?;
        let (transport, events) = self
            .factory
            .create(TransportOptions::responder())
            .await
            .map_err(|e| SessionError::transport(format!("{:#}", e)))?;

        let mut session = Session::new(Role::Responder, transport.clone(), events, guard);
        if let Err(e) = transport.signal(offer.clone()).await {
            let reason = format!("Failed to apply offer: {:#}", e);
            session.fail(reason.clone()).await;
            return Err(signal_error(&e, reason));
        }
        session.remote = Some(offer);

        log::debug!("Started responder session, offer applied");
        Ok(session)
    }
}

/// Map a failed `signal` call: an unusable descriptor is the caller's
/// mistake, anything else is the transport's.
fn signal_error(err: &anyhow::Error, reason: String) -> SessionError {
    match err.downcast_ref::<DescriptorRejected>() {
        Some(rejected) => SessionError::InvalidDescriptor(rejected.0.clone()),
        None => SessionError::TransportFailure(reason),
    }
}

/// One attempted or established connection.
///
/// The transport is released when the session fails, is closed, or is
/// dropped.
pub struct Session {
    role: Role,
    state: SessionState,
    local: Option<SignalingDescriptor>,
    remote: Option<SignalingDescriptor>,
    transport: Option<Arc<dyn Transport>>,
    events: TransportEvents,
    inbox: VecDeque<Bytes>,
    failure: Option<String>,
    guard: Option<ActiveGuard>,
}

impl Session {
    fn new(
        role: Role,
        transport: Arc<dyn Transport>,
        events: TransportEvents,
        guard: ActiveGuard,
    ) -> Self {
        Self {
            role,
            state: SessionState::Idle,
            local: None,
            remote: None,
            transport: Some(transport),
            events,
            inbox: VecDeque::new(),
            failure: None,
            guard: Some(guard),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn local(&self) -> Option<&SignalingDescriptor> {
        self.local.as_ref()
    }

    pub fn remote(&self) -> Option<&SignalingDescriptor> {
        self.remote.as_ref()
    }

    /// Why the session failed, if it did.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Wait for the transport to produce the local descriptor.
    ///
    /// For the initiator this is the offer; handing it out moves the session
    /// to `AwaitingRemoteDescriptor`. For the responder it is the answer and
    /// the session stays `LocalDescriptionReady` until connected.
    pub async fn local_descriptor(&mut self) -> Result<SignalingDescriptor, SessionError> {
        while self.local.is_none() {
            self.ensure_not_failed()?;
            self.pump().await;
        }

        if self.role == Role::Initiator && self.state == SessionState::LocalDescriptionReady {
            self.state = SessionState::AwaitingRemoteDescriptor;
        }

        self.local
            .clone()
            .ok_or_else(|| SessionError::transport("local descriptor missing"))
    }

    /// Apply the answer delivered back through the out-of-band channel.
    ///
    /// Never overwrites: a second call, any call on a responder, and any call
    /// on a connected session fail with `AlreadyApplied`.
    pub async fn apply_remote_descriptor(
        &mut self,
        descriptor: SignalingDescriptor,
    ) -> Result<(), SessionError> {
        self.ensure_not_failed()?;

        if self.remote.is_some() || self.state == SessionState::Connected {
            return Err(SessionError::AlreadyApplied);
        }
        if descriptor.kind != self.role.remote_kind() {
            return Err(SessionError::InvalidDescriptor(format!(
                "expected an {}, got an {}",
                self.role.remote_kind(),
                descriptor.kind
            )));
        }
        if self.local.is_none() {
            return Err(SessionError::InvalidDescriptor(
                "local description is not ready yet".to_string(),
            ));
        }

        let transport = self.transport()?;
        if let Err(e) = transport.signal(descriptor.clone()).await {
            let reason = format!("Failed to apply {}: {:#}", descriptor.kind, e);
            let err = signal_error(&e, reason.clone());
            // A rejected descriptor leaves the session waiting for another
            if matches!(err, SessionError::TransportFailure(_)) {
                self.fail(reason).await;
            }
            return Err(err);
        }

        self.remote = Some(descriptor);
        self.state = SessionState::AwaitingRemoteDescriptor;
        log::debug!("Remote descriptor applied, waiting for connection");
        Ok(())
    }

    /// Wait until the data channel is usable.
    ///
    /// `None` waits forever. On timeout the session fails and the transport
    /// is released.
    pub async fn wait_connected(&mut self, timeout: Option<Duration>) -> Result<(), SessionError> {
        let result = match timeout {
            Some(limit) => {
                let outcome = tokio::time::timeout(limit, self.pump_until_connected()).await;
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        let reason = format!("Connection timeout after {:?}", limit);
                        self.fail(reason.clone()).await;
                        Err(SessionError::TransportFailure(reason))
                    }
                }
            }
            None => self.pump_until_connected().await,
        };

        if result.is_ok() {
            log::info!("Peer connection established");
        }
        result
    }

    async fn pump_until_connected(&mut self) -> Result<(), SessionError> {
        while self.state != SessionState::Connected {
            self.ensure_not_failed()?;
            self.pump().await;
        }
        Ok(())
    }

    /// Hand one message to the transport.
    pub async fn send_message(&mut self, data: Bytes) -> Result<(), SessionError> {
        if self.state != SessionState::Connected {
            return Err(SessionError::ChannelNotReady);
        }

        let transport = self.transport()?;
        if let Err(e) = transport.send(data).await {
            let reason = format!("Send failed: {:#}", e);
            self.fail(reason.clone()).await;
            return Err(SessionError::TransportFailure(reason));
        }
        Ok(())
    }

    /// Next complete message from the peer.
    ///
    /// Messages that arrived while the session was waiting for something
    /// else are returned first, even if the peer has since closed.
    pub async fn next_message(&mut self) -> Result<Bytes, SessionError> {
        loop {
            if let Some(data) = self.inbox.pop_front() {
                return Ok(data);
            }
            if self.state != SessionState::Connected {
                self.ensure_not_failed()?;
                return Err(SessionError::ChannelNotReady);
            }
            self.pump().await;
        }
    }

    /// Wait for the peer to close its side, up to `limit`.
    ///
    /// Returns true if the peer closed in time. Used after a send so the
    /// final message is delivered before the local side tears down.
    pub async fn wait_peer_close(&mut self, limit: Duration) -> bool {
        let closed = async {
            while self.state != SessionState::Failed {
                self.pump().await;
            }
        };
        tokio::time::timeout(limit, closed).await.is_ok()
    }

    /// Explicit teardown: the session becomes `Failed` and the transport is
    /// released. The negotiator may start a new session afterwards.
    pub async fn close(&mut self) {
        if self.state != SessionState::Failed {
            self.fail("Closed by caller".to_string()).await;
        } else {
            self.release().await;
        }
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, SessionError> {
        self.transport
            .clone()
            .ok_or_else(|| SessionError::transport("transport already released"))
    }

    fn ensure_not_failed(&self) -> Result<(), SessionError> {
        if self.state == SessionState::Failed {
            return Err(SessionError::TransportFailure(
                self.failure
                    .clone()
                    .unwrap_or_else(|| "session failed".to_string()),
            ));
        }
        Ok(())
    }

    /// Process exactly one transport event.
    async fn pump(&mut self) {
        let Some(event) = self.events.recv().await else {
            self.fail("Transport event stream ended".to_string()).await;
            return;
        };

        match event {
            TransportEvent::Signal(descriptor) => self.on_signal(descriptor).await,
            TransportEvent::Connect => {
                if self.state != SessionState::Failed {
                    self.state = SessionState::Connected;
                }
            }
            TransportEvent::Data(data) => {
                log::debug!("Received message ({} bytes)", data.len());
                self.inbox.push_back(data);
            }
            TransportEvent::Error(reason) => {
                log::error!("Transport failed: {}", reason);
                self.fail(reason).await;
            }
            TransportEvent::Close => {
                log::debug!("Transport closed by peer");
                self.fail("Connection closed".to_string()).await;
            }
        }
    }

    async fn on_signal(&mut self, descriptor: SignalingDescriptor) {
        if self.local.is_some() {
            log::debug!("Ignoring extra {} from transport", descriptor.kind);
            return;
        }
        if descriptor.kind != self.role.local_kind() {
            self.fail(format!(
                "Transport produced an {} for the {:?} role",
                descriptor.kind, self.role
            ))
            .await;
            return;
        }

        self.local = Some(descriptor);
        if self.state == SessionState::Idle {
            self.state = SessionState::LocalDescriptionReady;
        }
    }

    async fn fail(&mut self, reason: String) {
        if self.state != SessionState::Failed {
            log::debug!("Session failed: {}", reason);
            self.state = SessionState::Failed;
            self.failure = Some(reason);
        }
        self.release().await;
    }

    async fn release(&mut self) {
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                log::warn!("Failed to close transport: {:#}", e);
            }
        }
        self.guard.take();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = transport.close().await {
                        log::warn!("Failed to close transport: {:#}", e);
                    }
                });
            }
            Err(_) => log::warn!("No runtime available to close transport of dropped session"),
        }
    }
}
