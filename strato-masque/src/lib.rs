//! MASQUE tunnel data plane
//!
//! Packet forwarding between a virtual network device and a CONNECT-IP
//! session carried over QUIC, plus the reconnecting lifecycle that keeps
//! the tunnel alive.

mod backoff;
mod device;
mod error;
mod forward;
mod lifecycle;
mod pool;
mod session;
mod stats;
pub mod tls;
pub mod transport;

pub use backoff::ExponentialBackoff;
pub use device::{MemoryDevice, TunnelDevice};
pub use error::{Error, Result};
pub use forward::run_forwarding;
pub use lifecycle::{maintain_tunnel, ConnectionConfig};
pub use pool::BufferPool;
pub use session::{IpSession, MemoryIpSession};
pub use stats::{monitor_stats, StatsSnapshot, TunnelStats, MONITOR_PERIOD};
pub use tls::{client_tls_config, ClientIdentity};
pub use transport::quic::QuicTransport;
pub use transport::{HandshakeResponse, MasqueTransport, TunnelSession};

/// Default tunnel MTU; other values work but trigger a warning upstream
pub const DEFAULT_MTU: usize = 1280;

/// Default QUIC initial packet size negotiated with the edge
pub const DEFAULT_INITIAL_PACKET_SIZE: u16 = 1242;
