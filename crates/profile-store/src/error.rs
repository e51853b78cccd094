//! Error types for store persistence and locking

/// Errors from store persistence and locking.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("store parse error: {0}")]
    Parse(String),

    #[error("unsupported store version {0}")]
    Version(u32),

    #[error("aborted while waiting for store lock")]
    Aborted,
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
