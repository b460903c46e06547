//! Errors from the wire protocol layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Empty frame")]
    EmptyFrame,
    #[error("Unknown message tag: {0}")]
    UnknownTag(u8),
    #[error("Insufficient data for {field}: need {needed} bytes, have {have}")]
    InsufficientData {
        field: &'static str,
        needed: usize,
        have: usize,
    },
    #[error("{extra} trailing bytes after {kind}")]
    TrailingBytes { kind: &'static str, extra: usize },
    #[error("Malformed {field}: {reason}")]
    Malformed { field: &'static str, reason: String },
    #[error("Field {field} too long to encode: {len} (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

impl WireError {
    /// Whether the byte stream that produced this error is desynchronized.
    ///
    /// A fatal error leaves the reader at an unknown frame boundary; the
    /// stream cannot be resynchronized and the process must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WireError::UnknownTag(_)
                | WireError::EmptyFrame
                | WireError::MessageTooLarge { .. }
                | WireError::InsufficientData { .. }
                | WireError::TrailingBytes { .. }
                | WireError::Malformed { .. }
        )
    }
}
