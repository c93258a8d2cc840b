//! Per-operation deadlines on a byte stream.
//!
//! [`TimedStream`] wraps any `AsyncRead + AsyncWrite` transport and arms a
//! fresh deadline for every read and every write. The secure session layered
//! on top has no timeouts of its own; this wrapper is what keeps a half-open
//! connection from pinning resources after the agent's line drops. A missed
//! deadline surfaces as `io::ErrorKind::TimedOut` and the owning session is
//! torn down by its caller.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// A byte stream whose every read and write must complete within a deadline.
#[derive(Debug)]
pub struct TimedStream<S> {
    inner: S,
    read_timeout: Duration,
    write_timeout: Duration,
    // Armed when an operation first returns Pending, cleared on completion.
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> TimedStream<S> {
    pub fn new(inner: S, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            inner,
            read_timeout,
            write_timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Consume the wrapper, returning the underlying stream.
    pub fn into_inner(self) -> S {
        self.inner
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{what} deadline exceeded"))
}

impl<S: AsyncRead + Unpin> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.read_deadline.is_none() {
            this.read_deadline = Some(Box::pin(tokio::time::sleep(this.read_timeout)));
        }

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(res) => {
                this.read_deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                if let Some(deadline) = this.read_deadline.as_mut() {
                    if deadline.as_mut().poll(cx).is_ready() {
                        this.read_deadline = None;
                        return Poll::Ready(Err(timed_out("read")));
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> TimedStream<S> {
    fn poll_timed_write<T>(
        &mut self,
        cx: &mut Context<'_>,
        what: &str,
        op: impl FnOnce(Pin<&mut S>, &mut Context<'_>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        if self.write_deadline.is_none() {
            self.write_deadline = Some(Box::pin(tokio::time::sleep(self.write_timeout)));
        }

        match op(Pin::new(&mut self.inner), cx) {
            Poll::Ready(res) => {
                self.write_deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                if let Some(deadline) = self.write_deadline.as_mut() {
                    if deadline.as_mut().poll(cx).is_ready() {
                        self.write_deadline = None;
                        return Poll::Ready(Err(timed_out(what)));
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut()
            .poll_timed_write(cx, "write", |inner, cx| inner.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut()
            .poll_timed_write(cx, "flush", |inner, cx| inner.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut()
            .poll_timed_write(cx, "shutdown", |inner, cx| inner.poll_shutdown(cx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(start_paused = true)]
    async fn read_times_out_on_silent_peer() {
        let (a, _b) = tokio::io::duplex(64);
        let mut timed = TimedStream::new(a, Duration::from_secs(6), Duration::from_secs(6));

        let mut buf = [0u8; 8];
        let err = timed.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn read_completes_when_data_arrives() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut timed = TimedStream::new(a, Duration::from_secs(6), Duration::from_secs(6));

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            b.write_all(b"ping").await.unwrap();
            b
        });

        let mut buf = [0u8; 4];
        timed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // The deadline is per operation: a later read gets a fresh one.
        let mut b = writer.await.unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        b.write_all(b"pong").await.unwrap();
        timed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test(start_paused = true)]
    async fn write_times_out_when_peer_stalls() {
        // Tiny buffer that nobody drains: the second write cannot progress.
        let (a, _b) = tokio::io::duplex(1);
        let mut timed = TimedStream::new(a, Duration::from_secs(6), Duration::from_secs(6));

        timed.write_all(&[1]).await.unwrap();
        let err = timed.write_all(&[2]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
