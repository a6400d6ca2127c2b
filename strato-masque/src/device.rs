//! Virtual network device capability
//!
//! The forwarding engine only ever needs two packet-granular operations
//! from the device, so the userspace stack (or a test double) is hidden
//! behind this trait. Implementations must tolerate one concurrent reader
//! and one concurrent writer without external locking.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// A device that produces and consumes single IP packets.
#[async_trait]
pub trait TunnelDevice: Send + Sync {
    /// Read one IP packet into `buf`, returning its length.
    ///
    /// Blocks until a packet is available and fails with
    /// [`Error::DeviceClosed`] once the device has been torn down.
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize>;

    /// Submit one IP packet to the device.
    ///
    /// Fails with [`Error::DeviceClosed`] once the device has been torn
    /// down.
    async fn write_packet(&self, pkt: &[u8]) -> Result<()>;
}

/// In-memory device backed by queues, for tests and loopback wiring.
///
/// Packets injected with [`inject_outbound`](Self::inject_outbound) are
/// returned by `read_packet` in order; packets passed to `write_packet`
/// are captured and can be inspected with [`written`](Self::written).
pub struct MemoryDevice {
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    written: std::sync::Mutex<Vec<Vec<u8>>>,
    write_notify: Notify,
    closed: CancellationToken,
}

impl MemoryDevice {
    pub fn new() -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            written: std::sync::Mutex::new(Vec::new()),
            write_notify: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    /// Queue a packet for the next `read_packet` call.
    pub fn inject_outbound(&self, pkt: Vec<u8>) {
        let _ = self.outbound_tx.send(pkt);
    }

    /// Packets written to the device so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().expect("device poisoned").clone()
    }

    /// Wait until at least `count` packets have been written.
    pub async fn wait_written(&self, count: usize) {
        loop {
            let notified = self.write_notify.notified();
            if self.written.lock().expect("device poisoned").len() >= count {
                return;
            }
            notified.await;
        }
    }

    /// Tear the device down; subsequent reads and writes fail.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelDevice for MemoryDevice {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        let mut rx = self.outbound_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(Error::DeviceClosed),
            pkt = rx.recv() => match pkt {
                Some(pkt) => {
                    let n = pkt.len().min(buf.len());
                    buf[..n].copy_from_slice(&pkt[..n]);
                    Ok(n)
                }
                None => Err(Error::DeviceClosed),
            },
        }
    }

    async fn write_packet(&self, pkt: &[u8]) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::DeviceClosed);
        }
        self.written
            .lock()
            .expect("device poisoned")
            .push(pkt.to_vec());
        self.write_notify.notify_waiters();
        Ok(())
    }
}
