//! Relay errors.

use std::time::Duration;

use protocol::{DataKind, RecordError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// No live transport. Callers of `send` never see this; their message
    /// is queued instead.
    #[error("Channel unavailable")]
    ChannelUnavailable,

    /// Request-style send found no listener on the other end.
    #[error("No receiving end for {0}")]
    NoReceiver(String),

    #[error("Timed out after {0:?} waiting for {1}")]
    Timeout(Duration, String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Permission denied: {0} collection is not allowed")]
    PermissionDenied(DataKind),

    #[error("Invalid record: {0}")]
    InvalidRecord(#[from] RecordError),

    #[error("Invalid handler registration: {0}")]
    InvalidHandler(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

impl RelayError {
    /// Errors that only affect one call and say nothing about the channel.
    pub fn is_per_call(&self) -> bool {
        matches!(
            self,
            RelayError::NoReceiver(_) | RelayError::MalformedMessage(_) | RelayError::Remote(_)
        )
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::MalformedMessage(err.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_names_the_kind() {
        let err = RelayError::PermissionDenied(DataKind::Gaze);
        assert!(err.to_string().contains("gaze"));
    }

    #[test]
    fn timeout_mentions_what_was_awaited() {
        let err = RelayError::Timeout(Duration::from_millis(250), "PING".to_string());
        let display = err.to_string();
        assert!(display.contains("250ms"));
        assert!(display.contains("PING"));
    }

    #[test]
    fn per_call_classification() {
        assert!(RelayError::NoReceiver("background".into()).is_per_call());
        assert!(!RelayError::ChannelUnavailable.is_per_call());
        assert!(!RelayError::Timeout(Duration::from_secs(1), "x".into()).is_per_call());
    }
}
