//! The connection capability a [`Session`](crate::core::negotiator::Session) drives.
//!
//! A transport owns ICE negotiation, SDP handling and the data channel. The
//! session only sees the events below and the four operations of
//! [`Transport`]. Events are delivered in order through an `mpsc` channel that
//! the session is the sole consumer of.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::signaling::codec::SignalingDescriptor;

pub mod loopback;

/// Buffer size for transport event channels
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Construction options, mirroring `{initiator, trickle}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub initiator: bool,
    /// Always false: descriptors are only emitted once every candidate has
    /// been gathered, so each side produces exactly one descriptor.
    pub trickle: bool,
}

impl TransportOptions {
    pub fn initiator() -> Self {
        Self {
            initiator: true,
            trickle: false,
        }
    }

    pub fn responder() -> Self {
        Self {
            initiator: false,
            trickle: false,
        }
    }
}

/// Everything a transport reports back to its session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Local descriptor is complete and ready to be delivered to the peer.
    Signal(SignalingDescriptor),
    /// Data channel is open.
    Connect,
    /// One complete message from the peer.
    Data(Bytes),
    /// Negotiation or channel failure.
    Error(String),
    /// Peer or transport closed the connection.
    Close,
}

pub type TransportEvents = mpsc::Receiver<TransportEvent>;

/// Returned by [`Transport::signal`] when the descriptor itself cannot be
/// used (unparseable or foreign SDP). Nothing was applied.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct DescriptorRejected(pub String);

#[async_trait]
pub trait Transport: Send + Sync {
    /// Feed the remote descriptor into the transport.
    async fn signal(&self, descriptor: SignalingDescriptor) -> Result<()>;

    /// Transmit one message. Success means the message was handed to the
    /// transport, not that the peer received it.
    async fn send(&self, data: Bytes) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Release the underlying connection. Calling it twice is harmless.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// `createConnection(isInitiator)`. An initiator emits its offer through
    /// the returned events without further input; a responder waits for
    /// [`Transport::signal`] with the offer.
    async fn create(
        &self,
        options: TransportOptions,
    ) -> Result<(Arc<dyn Transport>, TransportEvents)>;
}
