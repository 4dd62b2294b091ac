use thiserror::Error;

/// Failures surfaced by the handshake and transfer operations.
///
/// None of these are retried internally. `MalformedSignal`, `InvalidDescriptor`
/// and `AlreadyApplied` reject a single call and leave the session as it was;
/// `TransportFailure` moves the session to `Failed` and a new session is
/// required.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("malformed signal: {0}")]
    MalformedSignal(String),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("a remote descriptor was already applied to this session")]
    AlreadyApplied,

    #[error("data channel is not connected")]
    ChannelNotReady,

    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The negotiator only drives one session at a time.
    #[error("another session is still active; close it before starting a new one")]
    SessionActive,
}

impl SessionError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        SessionError::MalformedSignal(reason.into())
    }

    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        SessionError::TransportFailure(err.to_string())
    }
}

/// Error returned when the user interrupts a handshake or transfer with Ctrl+C.
///
/// This error should be handled at the CLI level by exiting with code 130
/// (standard Unix convention for SIGINT).
#[derive(Debug, Clone, Copy)]
pub struct Interrupted;

impl std::fmt::Display for Interrupted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transfer interrupted")
    }
}

impl std::error::Error for Interrupted {}

/// Check if an error is an Interrupted error.
pub fn is_interrupted(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Interrupted>().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_interrupted_detects_marker() {
        let err = anyhow::Error::new(Interrupted);
        assert!(is_interrupted(&err));

        let other = anyhow::anyhow!("something else");
        assert!(!is_interrupted(&other));
    }

    #[test]
    fn test_session_error_survives_anyhow() {
        let err: anyhow::Error = SessionError::ChannelNotReady.into();
        assert_eq!(
            err.downcast_ref::<SessionError>(),
            Some(&SessionError::ChannelNotReady)
        );
    }
}
