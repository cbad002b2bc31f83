//! Error types for the chatd library.

use std::io;

/// Result type alias for chatd operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur during protocol operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid command code: {0}")]
    InvalidCommand(u32),

    #[error("Command {0:?} is only sent by the server")]
    ServerOnlyCommand(crate::constants::Command),

    #[error("Frame too large: {len} bytes (limit {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Malformed record: {0}")]
    MalformedRecord(String),
}
