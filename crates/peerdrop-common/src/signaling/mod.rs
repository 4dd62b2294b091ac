//! Out-of-band signaling: how an offer or answer leaves one peer and reaches
//! the other without a signaling server.

pub mod channel;
pub mod codec;
pub mod relay;
pub mod store;
