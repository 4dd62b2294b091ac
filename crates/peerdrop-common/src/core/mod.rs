pub mod error;
pub mod negotiator;
pub mod transfer;
