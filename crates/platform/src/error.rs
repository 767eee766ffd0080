//! Error types for Tern

use thiserror::Error;

/// Unified error type for all Tern operations
#[derive(Debug, Error)]
pub enum TernError {
    /// I/O error (read/write failure, socket closed)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol error (bad framing, checksum, unexpected message)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Security error (cipher, key validation, host key trust)
    #[error("Security error: {0}")]
    Security(String),

    /// Authentication error (all methods exhausted, access denied)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The server closed the connection with a reason
    #[error("Disconnected by server: {0}")]
    Disconnected(String),

    /// A connection phase did not complete in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Not implemented
    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

impl TernError {
    /// Returns true for errors that end the connection without anything
    /// having gone wrong locally.
    pub fn is_graceful(&self) -> bool {
        matches!(self, TernError::Disconnected(_))
    }
}

/// Result type for Tern operations
pub type TernResult<T> = Result<T, TernError>;
