//! Proxy engine
//!
//! Configuration, the SOCKS5 frontend and the service composition that
//! turns a maintained MASQUE tunnel into a local proxy.

mod config;
mod error;
mod net;
mod service;
mod socks;

pub use config::{Config, LoggingConfig, RegistrationConfig, SocksConfig, TunnelConfig};
pub use error::{Error, Result};
pub use net::TimeoutConn;
pub use service::ProxyService;
pub use socks::{BoxedConn, Dialer, SocksServer, StreamConn};
