//! Tunnel connection lifecycle
//!
//! A single attempt brings the MASQUE session up, validates the CONNECT-IP
//! answer and runs the forwarding engine until it stops; the maintenance
//! loop wraps attempts in backoff-paced reconnection until the scope is
//! cancelled.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::backoff::ExponentialBackoff;
use crate::device::TunnelDevice;
use crate::error::{Error, Result};
use crate::forward::run_forwarding;
use crate::pool::BufferPool;
use crate::stats::{monitor_stats, TunnelStats};
use crate::transport::MasqueTransport;

/// Connection parameters for one tunnel.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Edge endpoint the transport dials
    pub endpoint: SocketAddr,
    /// Tunnel MTU; also sizes the packet buffer pool
    pub mtu: usize,
    /// Advisory packet-rate hint, carried but not enforced
    pub max_packet_rate: f64,
    /// Advisory burst hint, carried but not enforced
    pub max_burst: usize,
    /// Reconnection pacing
    pub backoff: ExponentialBackoff,
}

/// One connection attempt.
///
/// Returns the attempt counter to report to the backoff policy together
/// with the outcome: dial and handshake failures increment the counter,
/// while any completed forwarding session reports zero and leaves widening
/// the window to the policy's internal counter.
async fn handle_connection(
    transport: &dyn MasqueTransport,
    config: &ConnectionConfig,
    device: Arc<dyn TunnelDevice>,
    pool: Arc<BufferPool>,
    stats: Arc<TunnelStats>,
    attempt: u32,
    cancel: &CancellationToken,
) -> (u32, Result<()>) {
    info!(
        "Establishing MASQUE connection to {} (attempt #{})",
        config.endpoint,
        attempt + 1
    );

    let session = tokio::select! {
        _ = cancel.cancelled() => return (attempt + 1, Err(Error::Cancelled)),
        connected = transport.connect(config.endpoint) => match connected {
            Ok(session) => session,
            Err(e) => return (attempt + 1, Err(e)),
        },
    };

    if !session.response.is_ok() {
        stats.record_error();
        let status = session.response.status_line();
        session.ip.close().await;
        return (attempt + 1, Err(Error::HandshakeRejected(status)));
    }

    stats.record_handshake();
    info!("Connected to MASQUE server");

    let forwarding_scope = cancel.child_token();
    let monitor = tokio::spawn(monitor_stats(stats.clone(), forwarding_scope.clone()));

    let result = run_forwarding(
        device,
        session.ip.clone(),
        pool,
        stats.clone(),
        forwarding_scope.clone(),
    )
    .await;

    forwarding_scope.cancel();
    let _ = monitor.await;
    // Tear the session down on every path: IP connection, QUIC connection,
    // UDP socket, in that order.
    session.ip.close().await;

    let result = match result {
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(err) => {
            error!("Forwarding error: {err}");
            stats.record_error();
            Err(err)
        }
        Ok(()) => Ok(()),
    };
    (0, result)
}

/// Maintain the tunnel against `device` until `cancel` fires.
///
/// Every recoverable failure schedules a retry through the backoff policy;
/// the policy is reset only when a forwarding session ends without error,
/// so repeated short-lived sessions keep widening the retry window.
pub async fn maintain_tunnel(
    transport: Arc<dyn MasqueTransport>,
    config: ConnectionConfig,
    device: Arc<dyn TunnelDevice>,
    stats: Arc<TunnelStats>,
    cancel: CancellationToken,
) {
    let pool = Arc::new(BufferPool::new(config.mtu));
    let mut backoff = config.backoff.clone();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            info!("Scope cancelled, stopping tunnel maintenance");
            return;
        }

        let (new_attempt, result) = handle_connection(
            transport.as_ref(),
            &config,
            device.clone(),
            pool.clone(),
            stats.clone(),
            attempt,
            &cancel,
        )
        .await;
        attempt = new_attempt;

        if cancel.is_cancelled() {
            info!("Scope cancelled, stopping tunnel maintenance");
            return;
        }

        match result {
            Err(err) => {
                let delay = backoff.next_delay(new_attempt);
                info!("Connection error: {err}. Will retry in {:.1?}", delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return,
                }
            }
            Ok(()) => {
                backoff.reset();
                attempt = 0;
            }
        }
    }
}
