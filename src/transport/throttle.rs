use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

use crate::transport::{Conn, Dialer};

/// A dialer decorator that rate-limits the connections it hands out. Reads
///  and writes are paced independently to the configured bitrate, which makes
///  it possible to exercise the client against a fast server without
///  saturating the local link.
pub struct ThrottledDialer {
    inner: Arc<dyn Dialer>,
    bits_per_second: u64,
}

impl ThrottledDialer {
    pub fn new(inner: Arc<dyn Dialer>, bits_per_second: u64) -> ThrottledDialer {
        assert!(bits_per_second > 0, "throttle bitrate must be positive");
        ThrottledDialer {
            inner,
            bits_per_second,
        }
    }
}

#[async_trait]
impl Dialer for ThrottledDialer {
    async fn dial(&self, address: &str) -> anyhow::Result<Box<dyn Conn>> {
        let conn = self.inner.dial(address).await?;
        Ok(Box::new(PacedConn::new(conn, self.bits_per_second)))
    }
}

/// Tracks when the next transfer is allowed to start. After n bytes move, the
///  gate is pushed forward by their cost at the configured rate; transfers
///  that stay under the rate never wait.
struct Pacer {
    nanos_per_byte: u64,
    next_ready: Instant,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Pacer {
    fn new(bits_per_second: u64) -> Pacer {
        Pacer {
            nanos_per_byte: (8_000_000_000 / bits_per_second).max(1),
            next_ready: Instant::now(),
            sleep: None,
        }
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            if let Some(sleep) = &mut self.sleep {
                ready!(sleep.as_mut().poll(cx));
                self.sleep = None;
            }
            if Instant::now() >= self.next_ready {
                return Poll::Ready(());
            }
            self.sleep = Some(Box::pin(tokio::time::sleep_until(self.next_ready)));
        }
    }

    fn on_transferred(&mut self, count: usize) {
        let cost = Duration::from_nanos(self.nanos_per_byte.saturating_mul(count as u64));
        let base = self.next_ready.max(Instant::now());
        self.next_ready = base + cost;
    }
}

struct PacedConn<S> {
    inner: S,
    read_gate: Pacer,
    write_gate: Pacer,
}

impl<S> PacedConn<S> {
    fn new(inner: S, bits_per_second: u64) -> PacedConn<S> {
        PacedConn {
            inner,
            read_gate: Pacer::new(bits_per_second),
            write_gate: Pacer::new(bits_per_second),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PacedConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.read_gate.poll_ready(cx));
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.read_gate.on_transferred(buf.filled().len() - before);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PacedConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.write_gate.poll_ready(cx));
        let count = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.write_gate.on_transferred(count);
        Poll::Ready(Ok(count))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
