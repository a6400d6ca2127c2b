//! Error types for the proxy service

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the proxy
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed configuration or unparseable addresses
    #[error("configuration error: {0}")]
    Config(String),

    /// The configuration file could not be decoded
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// Tunnel data-plane failure
    #[error("tunnel error: {0}")]
    Tunnel(#[from] strato_masque::Error),

    /// Name resolution failure, reported to the SOCKS session only
    #[error("resolver error: {0}")]
    Resolve(#[from] strato_dns::Error),

    /// Virtual network stack failure
    #[error("network stack error: {0}")]
    Stack(#[from] strato_netstack::Error),

    /// SOCKS protocol violation on a client connection
    #[error("SOCKS error: {0}")]
    Socks(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Failures that abort startup rather than a single session
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }
}
