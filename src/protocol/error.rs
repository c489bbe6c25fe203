//! Protocol error types.

use thiserror::Error;

/// Errors related to overlay header and control message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid usage tag: {0}")]
    InvalidUsage(u8),

    #[error("message too short: expected at least {expected}, got {got}")]
    MessageTooShort { expected: usize, got: usize },

    #[error("message too long: max {max}, got {got}")]
    MessageTooLong { max: usize, got: usize },

    #[error("unsupported codec version: {0}")]
    UnsupportedVersion(u8),

    #[error("trailing bytes after message: {0}")]
    TrailingBytes(usize),

    #[error("invalid server action: {0}")]
    InvalidAction(u8),

    #[error("invalid utf-8 in string field")]
    InvalidString,

    #[error("malformed message: {0}")]
    Malformed(String),
}
