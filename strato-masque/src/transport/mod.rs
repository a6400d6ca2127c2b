//! Tunnel transport capability
//!
//! A transport knows how to bring up exactly one MASQUE session against an
//! edge endpoint: dial QUIC, issue the CONNECT-IP request, and hand back
//! the IP-packet connection together with the proxy's answer. The
//! maintenance loop owns retries; a transport attempt either yields a
//! session or a dial error.

mod icmp;
pub mod mock;
pub mod quic;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::session::IpSession;

/// The proxy's answer to the CONNECT-IP request.
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub status: u16,
    pub reason: String,
}

impl HandshakeResponse {
    pub fn ok() -> Self {
        Self {
            status: 200,
            reason: "OK".into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// Status text the way it is logged and surfaced in errors.
    pub fn status_line(&self) -> String {
        format!("{} {}", self.status, self.reason)
    }
}

/// One established (but not yet validated) tunnel attempt.
pub struct TunnelSession {
    pub ip: Arc<dyn IpSession>,
    pub response: HandshakeResponse,
}

/// Opens MASQUE sessions against a fixed edge deployment.
#[async_trait]
pub trait MasqueTransport: Send + Sync {
    /// Dial `endpoint` and perform the CONNECT-IP exchange.
    async fn connect(&self, endpoint: SocketAddr) -> Result<TunnelSession>;
}
