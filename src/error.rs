//! Error types for ESL operations

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type EslResult<T> = Result<T, EslError>;

/// Errors surfaced by connections, handshakes, and the wire framer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EslError {
    /// Malformed header block, truncated body, or oversized message.
    /// Fatal: the byte stream can no longer be trusted.
    #[error("framing error: {0}")]
    Framing(String),

    /// Socket read or write failure. Fatal to the connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The switch rejected our credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A bounded wait expired before the peer responded.
    #[error("timed out after {timeout:?}")]
    Timeout {
        /// How long we waited.
        timeout: Duration,
    },

    /// The connection was closed while an operation was waiting on it.
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame arrived whose kind has no delivery channel while other
    /// channels still exist. Indicates protocol desync.
    #[error("no route for frame kind {0}")]
    NoRoute(String),

    /// The switch answered a command with `-ERR`.
    #[error("command failed: {reply_text}")]
    CommandFailed {
        /// The raw reply text, e.g. `-ERR no such channel`.
        reply_text: String,
    },
}

impl EslError {
    /// Build a [`EslError::Framing`] from anything printable.
    pub(crate) fn framing(message: impl Into<String>) -> Self {
        EslError::Framing(message.into())
    }
}
