//! Tunnel traffic counters
//!
//! Scalar counters are plain atomics so both copy loops can update them
//! lock-free; the composite reconnect timestamp sits behind a mutex.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Interval between periodic stats log lines
pub const MONITOR_PERIOD: Duration = Duration::from_secs(300);

/// Counters for one tunnel's lifetime, shared by both forwarding loops
/// and the maintenance loop.
#[derive(Debug, Default)]
pub struct TunnelStats {
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    errors: AtomicU64,
    handshakes: AtomicU64,
    last_reconnect: Mutex<Option<Instant>>,
}

impl TunnelStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one packet received from the tunnel.
    pub fn record_packet_in(&self, bytes: usize) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record one packet sent into the tunnel.
    pub fn record_packet_out(&self, bytes: usize) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed CONNECT-IP handshake and stamp the reconnect time.
    pub fn record_handshake(&self) {
        self.handshakes.fetch_add(1, Ordering::Relaxed);
        *self.last_reconnect.lock().expect("stats poisoned") = Some(Instant::now());
    }

    pub fn last_reconnect(&self) -> Option<Instant> {
        *self.last_reconnect.lock().expect("stats poisoned")
    }

    /// Take a point-in-time snapshot of the counters.
    ///
    /// Counters are read independently, so a snapshot taken under traffic
    /// may be torn across fields; each field on its own never goes
    /// backwards.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            handshakes: self.handshakes.load(Ordering::Relaxed),
        }
    }
}

/// Counter values at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_in: u64,
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub errors: u64,
    pub handshakes: u64,
}

/// Periodically log a one-line summary until the scope is cancelled.
pub async fn monitor_stats(stats: std::sync::Arc<TunnelStats>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(MONITOR_PERIOD);
    // The first tick fires immediately; skip it so the first line lands
    // one full period after connect.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let s = stats.snapshot();
                info!(
                    "Tunnel stats: In: {} pkts ({} bytes), Out: {} pkts ({} bytes), Errors: {}, Handshakes: {}",
                    s.packets_in, s.bytes_in, s.packets_out, s.bytes_out, s.errors, s.handshakes
                );
            }
        }
    }
}
