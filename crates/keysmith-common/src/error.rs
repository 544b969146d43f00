//! Error types for KeySmith
//!
//! Every failure surfaced by the lock and memoization services is one of the
//! variants below. Caller-supplied callbacks keep their own error type; the
//! services only require `E: From<KeySmithError>`.

use std::time::Duration;

/// Library error taxonomy
#[derive(thiserror::Error, Debug)]
pub enum KeySmithError {
    /// The caller's token fired, or the attempt was terminated without an error
    #[error("operation was cancelled")]
    Cancelled,

    /// A bounded lock wait elapsed without an ownership grant
    #[error("lock wait timed out after {0:?}")]
    Timeout(Duration),

    /// The value was generated by another process and that generation failed
    #[error("an error has been raised during generation by another process: {0}")]
    Generation(String),

    /// Any I/O failure talking to the store
    #[error("store communication failure: {0}")]
    Store(String),

    /// Unexpected store response or invalid state transition
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl KeySmithError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, KeySmithError::Cancelled | KeySmithError::Timeout(_))
    }

    pub fn is_generation(&self) -> bool {
        matches!(self, KeySmithError::Generation(_))
    }

    /// Message carried by a remote generation failure
    pub fn generation_message(&self) -> Option<&str> {
        match self {
            KeySmithError::Generation(message) => Some(message),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, KeySmithError>;
