//! MASQUE IP-packet session capability
//!
//! The CONNECT-IP wire protocol lives behind this trait: the forwarding
//! engine sees a connection that moves whole IP datagrams and occasionally
//! hands back a synthetic ICMP reply (for example when a packet exceeds the
//! tunnel MTU). The production implementation rides QUIC datagrams; the
//! in-memory double below scripts the same surface for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// A bidirectional IP-packet connection through the MASQUE proxy.
#[async_trait]
pub trait IpSession: Send + Sync {
    /// Read one IP packet into `buf`, returning its length.
    ///
    /// `peek_header` asks the implementation to leave the IP header intact
    /// when the transport prefixes its own framing.
    async fn read_packet(&self, buf: &mut [u8], peek_header: bool) -> Result<usize>;

    /// Submit one IP packet.
    ///
    /// A non-empty return value is a synthetic ICMP reply that the caller
    /// must deliver back to the device.
    async fn write_packet(&self, pkt: &[u8]) -> Result<Vec<u8>>;

    /// Tear down the session and everything beneath it.
    async fn close(&self);
}

/// Scripted in-memory session for exercising the forwarding engine.
pub struct MemoryIpSession {
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    written: Mutex<Vec<Vec<u8>>>,
    write_notify: Notify,
    /// Echo every written packet back through the read side
    echo: bool,
    /// Fail the write path after this many packets, if set
    fail_after: Option<usize>,
    write_count: AtomicUsize,
    /// ICMP reply handed back on the next write, if set
    icmp_reply: Mutex<Option<Vec<u8>>>,
    closed: CancellationToken,
}

impl MemoryIpSession {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            written: Mutex::new(Vec::new()),
            write_notify: Notify::new(),
            echo: false,
            fail_after: None,
            write_count: AtomicUsize::new(0),
            icmp_reply: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    /// Echo endpoint: every packet written comes back on the read side.
    pub fn echo() -> Self {
        Self {
            echo: true,
            ..Self::new()
        }
    }

    /// Fail writes (and close the read side) after `count` packets.
    pub fn failing_after(count: usize) -> Self {
        Self {
            fail_after: Some(count),
            ..Self::new()
        }
    }

    /// Queue a packet for delivery through `read_packet`.
    pub fn inject_inbound(&self, pkt: Vec<u8>) {
        let _ = self.inbound_tx.send(pkt);
    }

    /// Hand back `reply` as the synthetic ICMP answer to the next write.
    pub fn set_icmp_reply(&self, reply: Vec<u8>) {
        *self.icmp_reply.lock().expect("session poisoned") = Some(reply);
    }

    /// Packets written so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().expect("session poisoned").clone()
    }

    /// Wait until at least `count` packets have been written.
    pub async fn wait_written(&self, count: usize) {
        loop {
            let notified = self.write_notify.notified();
            if self.written.lock().expect("session poisoned").len() >= count {
                return;
            }
            notified.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Default for MemoryIpSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IpSession for MemoryIpSession {
    async fn read_packet(&self, buf: &mut [u8], _peek_header: bool) -> Result<usize> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(Error::Forward("session closed".into())),
            pkt = rx.recv() => match pkt {
                Some(pkt) => {
                    let n = pkt.len().min(buf.len());
                    buf[..n].copy_from_slice(&pkt[..n]);
                    Ok(n)
                }
                None => Err(Error::Forward("session closed".into())),
            },
        }
    }

    async fn write_packet(&self, pkt: &[u8]) -> Result<Vec<u8>> {
        if self.closed.is_cancelled() {
            return Err(Error::Forward("session closed".into()));
        }
        let count = self.write_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = self.fail_after {
            if count > limit {
                self.closed.cancel();
                return Err(Error::Forward("connection reset by peer".into()));
            }
        }

        self.written
            .lock()
            .expect("session poisoned")
            .push(pkt.to_vec());
        self.write_notify.notify_waiters();

        if self.echo {
            let _ = self.inbound_tx.send(pkt.to_vec());
        }

        let reply = self.icmp_reply.lock().expect("session poisoned").take();
        Ok(reply.unwrap_or_default())
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_round_trips_packets() {
        let session = MemoryIpSession::echo();
        let reply = session.write_packet(&[1, 2, 3]).await.unwrap();
        assert!(reply.is_empty());

        let mut buf = [0u8; 16];
        let n = session.read_packet(&mut buf, true).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn icmp_reply_is_returned_once() {
        let session = MemoryIpSession::new();
        session.set_icmp_reply(vec![0x45, 0x00]);

        let reply = session.write_packet(&[1]).await.unwrap();
        assert_eq!(reply, vec![0x45, 0x00]);
        let reply = session.write_packet(&[2]).await.unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn failing_session_breaks_after_limit() {
        let session = MemoryIpSession::failing_after(2);
        session.write_packet(&[1]).await.unwrap();
        session.write_packet(&[2]).await.unwrap();
        assert!(session.write_packet(&[3]).await.is_err());
        assert!(session.is_closed());

        // Read side observes the failure as well.
        let mut buf = [0u8; 16];
        assert!(session.read_packet(&mut buf, true).await.is_err());
    }
}
