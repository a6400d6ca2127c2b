//! Virtual TCP connection handle
//!
//! The application half of a stack connection: bytes travel to and from
//! the reactor over bounded channels, which is also where backpressure
//! comes from.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio_util::sync::PollSender;

/// Largest chunk handed to the reactor per write
const WRITE_CHUNK: usize = 16 * 1024;

/// One TCP connection dialed through the virtual stack.
#[derive(Debug)]
pub struct VirtualTcpStream {
    rx: mpsc::Receiver<Vec<u8>>,
    leftover: Option<(Vec<u8>, usize)>,
    tx: PollSender<Vec<u8>>,
    reactor: Arc<Notify>,
}

impl VirtualTcpStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<Vec<u8>>,
        tx: mpsc::Sender<Vec<u8>>,
        reactor: Arc<Notify>,
    ) -> Self {
        Self {
            rx,
            leftover: None,
            tx: PollSender::new(tx),
            reactor,
        }
    }
}

impl AsyncRead for VirtualTcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some((data, offset)) = this.leftover.take() {
            let n = (data.len() - offset).min(buf.remaining());
            buf.put_slice(&data[offset..offset + n]);
            if offset + n < data.len() {
                this.leftover = Some((data, offset + n));
            }
            return Poll::Ready(Ok(()));
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    this.leftover = Some((data, n));
                }
                // Consuming frees channel capacity; let the reactor refill.
                this.reactor.notify_one();
                Poll::Ready(Ok(()))
            }
            // Channel closed: remote side finished, clean EOF.
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for VirtualTcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = buf.len().min(WRITE_CHUNK);
                this.tx
                    .send_item(buf[..n].to_vec())
                    .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
                this.reactor.notify_one();
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(_)) => {
                Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.tx.close();
        this.reactor.notify_one();
        Poll::Ready(Ok(()))
    }
}
