//! Error types for the wire protocol

use thiserror::Error;

/// Result type alias using [`ProtocolError`]
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while building, encoding or decoding messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame is shorter than its header or declared length
    #[error("Truncated frame: {0}")]
    Truncated(String),

    /// CRC32 did not match the frame contents
    #[error("CRC mismatch: expected {expected:x}, got {actual:x}")]
    Checksum {
        /// Checksum stored in the frame
        expected: u32,
        /// Checksum computed over the frame
        actual: u32,
    },

    /// Unknown action code in the frame header
    #[error("Unknown action code: {0}")]
    UnknownAction(u8),

    /// MessagePack encoding failed
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding failed
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Identifier failed validation (service name too long, bad uuid, ...)
    #[error("Invalid identifier: {0}")]
    InvalidId(String),
}

impl ProtocolError {
    /// Create a truncated-frame error
    pub fn truncated(msg: impl Into<String>) -> Self {
        Self::Truncated(msg.into())
    }

    /// Create an invalid-identifier error
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
