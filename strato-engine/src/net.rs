//! Idle-timeout connection wrapper
//!
//! SOCKS sessions hold flows open through the virtual stack; a session
//! that goes quiet must not pin tunnel resources forever. The wrapper arms
//! a deadline whenever a read or write has to wait and clears it on every
//! completed operation, so the timeout measures idle time, not transfer
//! time.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Byte-stream wrapper enforcing an idle timeout on reads and writes.
///
/// A zero timeout disables the deadlines entirely.
pub struct TimeoutConn<S> {
    inner: S,
    idle_timeout: Duration,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> TimeoutConn<S> {
    pub fn new(inner: S, idle_timeout: Duration) -> Self {
        Self {
            inner,
            idle_timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn poll_deadline(
    deadline: &mut Option<Pin<Box<Sleep>>>,
    idle_timeout: Duration,
    cx: &mut Context<'_>,
) -> Poll<io::Error> {
    if idle_timeout.is_zero() {
        return Poll::Pending;
    }
    let sleep = deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep(idle_timeout)));
    match sleep.as_mut().poll(cx) {
        Poll::Ready(()) => {
            *deadline = None;
            Poll::Ready(io::Error::from(io::ErrorKind::TimedOut))
        }
        Poll::Pending => Poll::Pending,
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimeoutConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => match poll_deadline(&mut this.read_deadline, this.idle_timeout, cx) {
                Poll::Ready(err) => Poll::Ready(Err(err)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimeoutConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => match poll_deadline(&mut this.write_deadline, this.idle_timeout, cx) {
                Poll::Ready(err) => Poll::Ready(Err(err)),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
