//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error from serde_json
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A single line could not be decoded into a frame
    ///
    /// Only that frame is lost; the decoder keeps processing the buffer.
    #[error("Malformed frame: {reason} (line: {line:?})")]
    Framing { reason: String, line: String },

    /// Frame length exceeds the limit configured on the decoder
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A known field carried a value of the wrong shape
    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// I/O error during frame operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Build a framing error for a rejected line
    pub(crate) fn framing(reason: impl ToString, line: &[u8]) -> Self {
        ProtocolError::Framing {
            reason: reason.to_string(),
            line: String::from_utf8_lossy(line).into_owned(),
        }
    }

    /// True for errors that only cost one frame and leave the stream usable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Framing { .. } | ProtocolError::FrameTooLarge { .. }
        )
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
