//! Error types for name resolution

use thiserror::Error;

/// Result type alias for resolver operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during name resolution
#[derive(Debug, Error)]
pub enum Error {
    /// The upstream lookup failed or returned no addresses
    #[error("resolve error: {0}")]
    Resolve(String),

    /// I/O error talking to the DNS server
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
