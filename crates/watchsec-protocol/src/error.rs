//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Invalid frame header
    #[error("Invalid frame header")]
    InvalidHeader,

    /// Frame encoded with a version this build does not understand
    #[error("Unsupported frame version: {0}")]
    UnsupportedVersion(u8),

    /// Agent identifier does not fit in the frame header
    #[error("Agent id too long: {0} bytes")]
    AgentIdTooLong(usize),

    /// Agent identifier is not valid UTF-8
    #[error("Agent id is not valid UTF-8")]
    InvalidAgentId,

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Incomplete frame received
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// JSON message could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
