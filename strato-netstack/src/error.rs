//! Error types for the userspace network stack

use thiserror::Error;

/// Result type alias for stack operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while using the virtual network stack
#[derive(Debug, Error)]
pub enum Error {
    /// The stack (or its reactor task) has been torn down
    #[error("network stack closed")]
    Closed,

    /// The requested network is not provided by this stack
    #[error("unsupported network: {0}")]
    Unsupported(String),

    /// A virtual connection could not be established
    #[error("connect error: {0}")]
    Connect(String),

    /// Stack construction failed
    #[error("stack setup error: {0}")]
    Setup(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
