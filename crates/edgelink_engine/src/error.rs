//! Error types for the engine.

use edgelink_protocol::ProtocolError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the engine.
///
/// Only configuration and resource errors reach callers of the public API;
/// transport and response failures are absorbed by the comm-status state
/// machine and reported through [`HostHandler`](crate::HostHandler).
#[derive(Error, Debug)]
pub enum EngineError {
    /// The server URL normalized to nothing.
    #[error("bad server URL: {0:?}")]
    BadUrl(String),

    /// A configuration with this role already exists.
    #[error("duplicate {0} server configuration")]
    DuplicateRole(&'static str),

    /// No configuration with this ID.
    #[error("unknown server configuration {0}")]
    UnknownConfiguration(usize),

    /// No device with this ID.
    #[error("unknown device {0}")]
    UnknownDevice(usize),

    /// A device with the same model and serial number already exists.
    #[error("duplicate device {model}/{serial}")]
    DuplicateDevice {
        /// Model number.
        model: String,
        /// Serial number.
        serial: String,
    },

    /// Backup or additional configurations need a primary first.
    #[error("no primary server configuration")]
    MissingPrimary,

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Document encoding or decoding error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A size limit prevented an allocation.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl EngineError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Transport { retryable, .. } => *retryable,
            EngineError::Protocol(_) => true,
            _ => false,
        }
    }
}
