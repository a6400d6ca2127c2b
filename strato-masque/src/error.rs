//! Error types for the tunnel data plane

use thiserror::Error;

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while establishing or driving the tunnel
#[derive(Debug, Error)]
pub enum Error {
    /// Key decoding, certificate generation or TLS assembly failed
    #[error("identity error: {0}")]
    Identity(String),

    /// UDP bind or QUIC dial failed
    #[error("dial error: {0}")]
    Dial(String),

    /// The CONNECT-IP request was answered with a non-200 status
    #[error("tunnel connection failed: {0}")]
    HandshakeRejected(String),

    /// I/O failure in one of the packet copy loops
    #[error("forwarding error: {0}")]
    Forward(String),

    /// Cooperative shutdown
    #[error("cancelled")]
    Cancelled,

    /// The virtual network device has been torn down
    #[error("tunnel device closed")]
    DeviceClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors the maintenance loop recovers from by reconnecting
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Dial(_) | Error::HandshakeRejected(_) | Error::Forward(_) | Error::Io(_)
        )
    }

    /// True for cooperative shutdown; never logged at error level
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
