//! peerdrop-common: Shared library for peerdrop
//!
//! This crate provides everything needed to connect two peers without a
//! signaling server and move a file between them:
//!
//! - `signaling`: offer/answer encoding and the out-of-band channels that
//!   carry them (copy/paste, URL parameter, QR code, polling relay)
//! - `core`: the connection negotiator, session state machine and file transfer
//! - `transport`: the opaque connection capability the session drives

pub mod core;
pub mod signaling;
pub mod transport;
