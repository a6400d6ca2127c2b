//! Bidirectional packet forwarding
//!
//! Two copy loops run under one cancellation scope: egress moves packets
//! from the virtual device into the MASQUE connection, ingress moves them
//! the other way. The first loop to fail wins the error channel and
//! cancels its sibling; external cancellation makes the engine return
//! [`Error::Cancelled`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::device::TunnelDevice;
use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::session::IpSession;
use crate::stats::TunnelStats;

/// Run both copy loops until one fails or the scope is cancelled.
///
/// Every buffer acquired from `pool` is released exactly once before this
/// function returns, on success and on every error path.
pub async fn run_forwarding(
    device: Arc<dyn TunnelDevice>,
    ip: Arc<dyn IpSession>,
    pool: Arc<BufferPool>,
    stats: Arc<TunnelStats>,
    cancel: CancellationToken,
) -> Result<()> {
    let scope = cancel.child_token();
    // First error wins; the second writer's message is dropped.
    let (err_tx, mut err_rx) = mpsc::channel::<Error>(2);

    let egress = tokio::spawn(egress_loop(
        device.clone(),
        ip.clone(),
        pool.clone(),
        stats.clone(),
        scope.clone(),
        err_tx.clone(),
    ));
    let ingress = tokio::spawn(ingress_loop(
        device,
        ip,
        pool,
        stats,
        scope.clone(),
        err_tx,
    ));

    let result = tokio::select! {
        maybe_err = err_rx.recv() => match maybe_err {
            Some(err) => Err(err),
            None => Err(Error::Cancelled),
        },
        _ = cancel.cancelled() => Err(Error::Cancelled),
    };

    // Make sure both loops have returned their buffers before reporting.
    scope.cancel();
    let _ = egress.await;
    let _ = ingress.await;
    result
}

fn fail(err_tx: &mpsc::Sender<Error>, scope: &CancellationToken, err: Error) {
    let _ = err_tx.try_send(err);
    scope.cancel();
}

/// Device -> MASQUE. A write may yield a synthetic ICMP reply which is
/// delivered straight back to the device.
async fn egress_loop(
    device: Arc<dyn TunnelDevice>,
    ip: Arc<dyn IpSession>,
    pool: Arc<BufferPool>,
    stats: Arc<TunnelStats>,
    scope: CancellationToken,
    err_tx: mpsc::Sender<Error>,
) {
    loop {
        let mut buf = pool.acquire();

        let n = tokio::select! {
            _ = scope.cancelled() => {
                pool.release(buf);
                return;
            }
            read = device.read_packet(&mut buf) => match read {
                Ok(n) => n,
                Err(e) => {
                    pool.release(buf);
                    fail(
                        &err_tx,
                        &scope,
                        Error::Forward(format!("failed to read from TUN device: {e}")),
                    );
                    return;
                }
            },
        };

        stats.record_packet_out(n);
        let icmp = tokio::select! {
            _ = scope.cancelled() => {
                pool.release(buf);
                return;
            }
            written = ip.write_packet(&buf[..n]) => match written {
                Ok(icmp) => icmp,
                Err(e) => {
                    pool.release(buf);
                    fail(
                        &err_tx,
                        &scope,
                        Error::Forward(format!("failed to write to IP connection: {e}")),
                    );
                    return;
                }
            },
        };

        // Grown buffers are dirty; let them drop instead of recycling.
        if buf.capacity() < 2 * pool.capacity() {
            pool.release(buf);
        }

        if !icmp.is_empty() {
            if let Err(e) = device.write_packet(&icmp).await {
                fail(
                    &err_tx,
                    &scope,
                    Error::Forward(format!("failed to write ICMP to TUN device: {e}")),
                );
                return;
            }
            stats.record_packet_in(icmp.len());
        }
    }
}

/// MASQUE -> device.
async fn ingress_loop(
    device: Arc<dyn TunnelDevice>,
    ip: Arc<dyn IpSession>,
    pool: Arc<BufferPool>,
    stats: Arc<TunnelStats>,
    scope: CancellationToken,
    err_tx: mpsc::Sender<Error>,
) {
    loop {
        let mut buf = pool.acquire();

        let n = tokio::select! {
            _ = scope.cancelled() => {
                pool.release(buf);
                return;
            }
            read = ip.read_packet(&mut buf, true) => match read {
                Ok(n) => n,
                Err(e) => {
                    pool.release(buf);
                    fail(
                        &err_tx,
                        &scope,
                        Error::Forward(format!("failed to read from IP connection: {e}")),
                    );
                    return;
                }
            },
        };

        stats.record_packet_in(n);
        if let Err(e) = device.write_packet(&buf[..n]).await {
            pool.release(buf);
            fail(
                &err_tx,
                &scope,
                Error::Forward(format!("failed to write to TUN device: {e}")),
            );
            return;
        }

        if buf.capacity() < 2 * pool.capacity() {
            pool.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::session::MemoryIpSession;
    use std::time::Duration;

    fn fixtures() -> (
        Arc<MemoryDevice>,
        Arc<BufferPool>,
        Arc<TunnelStats>,
        CancellationToken,
    ) {
        (
            Arc::new(MemoryDevice::new()),
            Arc::new(BufferPool::new(1280)),
            Arc::new(TunnelStats::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn packets_flow_both_directions() {
        let (device, pool, stats, cancel) = fixtures();
        let session = Arc::new(MemoryIpSession::new());

        device.inject_outbound(vec![1; 64]);
        device.inject_outbound(vec![2; 32]);
        session.inject_inbound(vec![3; 48]);

        let task = tokio::spawn(run_forwarding(
            device.clone(),
            session.clone(),
            pool.clone(),
            stats.clone(),
            cancel.clone(),
        ));

        session.wait_written(2).await;
        device.wait_written(1).await;

        assert_eq!(session.written(), vec![vec![1; 64], vec![2; 32]]);
        assert_eq!(device.written(), vec![vec![3; 48]]);

        let s = stats.snapshot();
        assert_eq!(s.packets_out, 2);
        assert_eq!(s.bytes_out, 96);
        assert_eq!(s.packets_in, 1);
        assert_eq!(s.bytes_in, 48);

        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn external_cancellation_returns_cancelled_promptly() {
        let (device, pool, stats, cancel) = fixtures();
        let session = Arc::new(MemoryIpSession::new());

        let task = tokio::spawn(run_forwarding(
            device,
            session,
            pool,
            stats,
            cancel.clone(),
        ));
        tokio::task::yield_now().await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(100), task)
            .await
            .expect("loops did not exit in time")
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn first_error_wins_and_stops_the_sibling() {
        let (device, pool, stats, cancel) = fixtures();
        let session = Arc::new(MemoryIpSession::failing_after(1));

        device.inject_outbound(vec![1; 8]);
        device.inject_outbound(vec![2; 8]);

        let result = tokio::time::timeout(
            Duration::from_millis(100),
            run_forwarding(device, session, pool.clone(), stats, cancel),
        )
        .await
        .expect("engine did not stop in time");

        match result {
            Err(Error::Forward(msg)) => assert!(msg.contains("IP connection")),
            other => panic!("expected forward error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn buffers_balance_after_session() {
        let (device, pool, stats, cancel) = fixtures();
        let session = Arc::new(MemoryIpSession::new());

        for i in 0..16 {
            device.inject_outbound(vec![i; 100]);
            session.inject_inbound(vec![i; 100]);
        }

        let task = tokio::spawn(run_forwarding(
            device.clone(),
            session.clone(),
            pool.clone(),
            stats,
            cancel.clone(),
        ));
        session.wait_written(16).await;
        device.wait_written(16).await;
        cancel.cancel();
        let _ = task.await.unwrap();

        // Everything handed out came back; at most the two in-flight loop
        // buffers were ever outstanding at once, so at most two distinct
        // buffers exist.
        assert!((1..=2).contains(&pool.len()));
        let free = pool.len();
        let buf = pool.acquire();
        pool.release(buf);
        assert_eq!(pool.len(), free);
    }

    #[tokio::test]
    async fn icmp_reply_goes_back_to_the_device() {
        let (device, pool, stats, cancel) = fixtures();
        let session = Arc::new(MemoryIpSession::new());
        let reply = vec![0x45, 0x00, 0x00, 0x38];
        session.set_icmp_reply(reply.clone());

        device.inject_outbound(vec![9; 2000]);

        let task = tokio::spawn(run_forwarding(
            device.clone(),
            session.clone(),
            pool,
            stats.clone(),
            cancel.clone(),
        ));
        device.wait_written(1).await;

        assert_eq!(device.written(), vec![reply.clone()]);
        assert_eq!(stats.snapshot().bytes_in, reply.len() as u64);

        cancel.cancel();
        let _ = task.await.unwrap();
    }
}
