//! Sliding idle timeout for proxied streams.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};

/// Wraps a stream so that any read or write resets a shared deadline;
/// when the connection stays silent past the timeout, pending reads and
/// writes fail with [`io::ErrorKind::TimedOut`]. A zero timeout
/// disables the deadline entirely.
pub struct IdleTimeoutStream<S> {
    inner: S,
    timeout: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> IdleTimeoutStream<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        let deadline = (timeout > Duration::ZERO).then(|| Box::pin(sleep(timeout)));
        Self {
            inner,
            timeout,
            deadline,
        }
    }

    /// The wrapped stream, for socket-level lookups.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn bump(&mut self) {
        if let Some(deadline) = &mut self.deadline {
            deadline.as_mut().reset(Instant::now() + self.timeout);
        }
    }

    /// Ready with an error once the idle deadline has passed.
    fn poll_idle(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(deadline) = &mut self.deadline {
            if deadline.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(io::ErrorKind::TimedOut.into()));
            }
        }
        Poll::Pending
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeoutStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Pending => this.poll_idle(cx),
            ready => {
                this.bump();
                ready
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeoutStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Pending => match this.poll_idle(cx) {
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                _ => Poll::Pending,
            },
            ready => {
                this.bump();
                ready
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Traffic at a shorter interval than the timeout keeps the
    /// connection alive; once the peer goes silent past the timeout,
    /// the pending read fails with TimedOut.
    #[tokio::test(start_paused = true)]
    async fn deadline_slides_with_traffic() {
        let (mut feeder, idle_side) = tokio::io::duplex(64);
        let mut idle = IdleTimeoutStream::new(idle_side, Duration::from_millis(100));

        tokio::spawn(async move {
            for _ in 0..4 {
                tokio::time::sleep(Duration::from_millis(50)).await;
                feeder.write_all(b"x").await.unwrap();
            }
            // Keep the pipe open but silent.
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(feeder);
        });

        let mut buf = [0u8; 1];
        for _ in 0..4 {
            idle.read_exact(&mut buf).await.unwrap();
        }
        let err = idle.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    /// A zero timeout never expires.
    #[tokio::test(start_paused = true)]
    async fn zero_timeout_disables() {
        let (feeder, idle_side) = tokio::io::duplex(64);
        let mut idle = IdleTimeoutStream::new(idle_side, Duration::ZERO);

        let mut buf = [0u8; 1];
        let waited =
            tokio::time::timeout(Duration::from_secs(30), idle.read_exact(&mut buf)).await;
        // The outer timer fires; the stream itself never timed out.
        assert!(waited.is_err());
        drop(feeder);
    }

    /// Writes reset the deadline too.
    #[tokio::test(start_paused = true)]
    async fn writes_keep_alive() {
        let (mut drain_side, idle_side) = tokio::io::duplex(1024);
        let mut idle = IdleTimeoutStream::new(idle_side, Duration::from_millis(100));

        tokio::spawn(async move {
            let mut sink = Vec::new();
            let _ = drain_side.read_to_end(&mut sink).await;
        });

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            idle.write_all(b"payload").await.unwrap();
        }
    }
}
