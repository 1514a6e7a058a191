//! Protocol errors.

use thiserror::Error;

/// Errors reading or writing protocol messages.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The peer's pipe failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line was not a valid message.
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}
