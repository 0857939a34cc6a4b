use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Hard cap on read-ahead growth. A client drip-feeding header bytes
/// cannot grow the buffer past this.
pub const MAX_PEEK: usize = 16 * 1024;

/// Buffered reader with explicit look-ahead.
///
/// `peek` grows an internal buffer without consuming; `consume` commits
/// bytes into a replay buffer the pipeline later writes to the upstream
/// connection. Reads drain the unconsumed look-ahead before touching the
/// underlying stream, so the destination always sees the exact byte
/// stream the client sent.
pub struct PeekReader<R> {
    inner: R,
    buf: Vec<u8>,
    replay: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> PeekReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            replay: Vec::new(),
            eof: false,
        }
    }

    /// Ensures up to `n` bytes are buffered and returns them without
    /// consuming. The returned slice is shorter than `n` only when the
    /// stream hit EOF first. `n` beyond [`MAX_PEEK`] is an error.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        if n > MAX_PEEK {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "peek window exceeds limit",
            ));
        }

        let mut chunk = [0u8; 2048];
        while self.buf.len() < n && !self.eof {
            let want = (n - self.buf.len()).min(chunk.len());
            let read = self.inner.read(&mut chunk[..want]).await?;
            if read == 0 {
                self.eof = true;
                break;
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }

        Ok(&self.buf[..self.buf.len().min(n)])
    }

    /// True once the underlying stream reported EOF during a peek.
    pub fn saw_eof(&self) -> bool {
        self.eof
    }

    /// Commits `n` buffered bytes: they move to the replay buffer and
    /// will not be yielded by subsequent reads.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.replay.extend_from_slice(&self.buf[..n]);
        self.buf.drain(..n);
    }

    /// Takes the bytes committed so far by `consume`.
    pub fn take_replay(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.replay)
    }

    /// Unconsumed look-ahead bytes.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PeekReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            out.put_slice(&self.buf[..n]);
            self.buf.drain(..n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, out)
    }
}
