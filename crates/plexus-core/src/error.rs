//! Error types for Plexus Core

use plexus_protocol::{ProtocolError, TransactionState};
use thiserror::Error;

/// Result type alias using Plexus Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    /// Null input, wrong element type, missing primary-key field
    #[error("Validation error: {0}")]
    Validation(String),

    /// Record absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Another transaction holds the service lock
    #[error("Lock failed: {0}")]
    LockFailed(String),

    /// Commit deadline or bounded wait expired
    #[error("Timed out: {0}")]
    TimedOut(String),

    /// A peer answered with an error or could not be reached
    #[error("Peer failure: {0}")]
    PeerFailure(String),

    /// The service handler returned an error
    #[error("Handler error: {0}")]
    Handler(String),

    /// The receiving peer is no longer leader of the service
    #[error("Election race: {0}")]
    ElectionRace(String),

    /// Unexpected transaction state for the requested step
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Storage sink errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Record (de)serialization errors
    #[error("Codec error: {0}")]
    Codec(String),

    /// Wire protocol errors
    #[error("Wire error: {0}")]
    Wire(#[from] ProtocolError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// I/O errors from storage sinks and config files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a lock-failed error
    pub fn lock_failed(msg: impl Into<String>) -> Self {
        Self::LockFailed(msg.into())
    }

    /// Create a timeout error
    pub fn timed_out(msg: impl Into<String>) -> Self {
        Self::TimedOut(msg.into())
    }

    /// Create a peer failure
    pub fn peer(msg: impl Into<String>) -> Self {
        Self::PeerFailure(msg.into())
    }

    /// Create a handler error
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    /// Create an election race error
    pub fn election_race(msg: impl Into<String>) -> Self {
        Self::ElectionRace(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Map a failed transaction outcome to the error its caller sees
    pub fn from_outcome(state: TransactionState, err_msg: &str) -> Self {
        if err_msg.is_empty() {
            let msg = format!("transaction ended {state}");
            return match state {
                TransactionState::LockFailed => Self::LockFailed(msg),
                TransactionState::Rollbacked => Self::Handler(msg),
                _ => Self::PeerFailure(msg),
            };
        }
        match (state, Self::from_remote(err_msg)) {
            (TransactionState::LockFailed, err @ Self::LockFailed(_)) => err,
            (TransactionState::LockFailed, other) => Self::LockFailed(other.to_string()),
            (TransactionState::Rollbacked, err @ Self::Handler(_)) => err,
            (TransactionState::Rollbacked, other) => Self::Handler(other.to_string()),
            (_, err) => err,
        }
    }

    /// Rebuild an error from the text a peer sent back; text without a
    /// known prefix is a [`Error::PeerFailure`]
    pub fn from_remote(text: &str) -> Self {
        let Some((prefix, rest)) = text.split_once(": ") else {
            return Self::PeerFailure(text.to_string());
        };
        let rest = rest.to_string();
        match prefix {
            "Validation error" => Self::Validation(rest),
            "Not found" => Self::NotFound(rest),
            "Lock failed" => Self::LockFailed(rest),
            "Timed out" => Self::TimedOut(rest),
            "Peer failure" => Self::PeerFailure(rest),
            "Handler error" => Self::Handler(rest),
            "Election race" => Self::ElectionRace(rest),
            "Protocol error" => Self::Protocol(rest),
            "Storage error" => Self::Storage(rest),
            "Codec error" => Self::Codec(rest),
            _ => Self::PeerFailure(text.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_mapping() {
        assert!(matches!(
            Error::from_outcome(TransactionState::LockFailed, ""),
            Error::LockFailed(_)
        ));
        assert!(matches!(
            Error::from_outcome(TransactionState::Errored, "Handler error: boom"),
            Error::Handler(_)
        ));
        assert!(matches!(
            Error::from_outcome(TransactionState::Errored, "Timed out: commit deadline"),
            Error::TimedOut(_)
        ));
        assert!(matches!(
            Error::from_outcome(TransactionState::Failed, "peer gone"),
            Error::PeerFailure(_)
        ));
    }

    #[test]
    fn test_remote_text_keeps_variant() {
        let err = Error::from_remote(&Error::not_found("\"a\"").to_string());
        assert!(matches!(&err, Error::NotFound(m) if m == "\"a\""));
        assert_eq!(err.to_string(), "Not found: \"a\"");
        assert!(matches!(Error::from_remote("socket closed"), Error::PeerFailure(_)));
        assert!(matches!(
            Error::from_outcome(TransactionState::LockFailed, "Timed out: Lock to 1a2b"),
            Error::LockFailed(_)
        ));
    }

    #[test]
    fn test_error_display() {
        let err = Error::not_found("a");
        assert_eq!(err.to_string(), "Not found: a");
    }
}
