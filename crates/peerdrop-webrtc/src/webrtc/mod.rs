//! WebRTC transport and the two command flows built on it

pub mod accept;
pub mod common;
pub mod exchange;
pub mod framing;
pub mod offer;
pub mod transport;

pub use accept::run_accept;
pub use offer::run_offer;
