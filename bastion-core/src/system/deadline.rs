//! Per-operation I/O deadlines.
//!
//! [`TimedStream`] wraps any byte stream and arms an absolute deadline at
//! the start of every read and every write; the deadline is dropped as
//! soon as the operation completes, so each subsequent operation gets a
//! fresh window. A zero duration disables the respective deadline.
//!
//! Handshake stages run with short windows and switch to the (much longer)
//! transfer windows via [`TimedStream::set_timeouts`] once the tunnel is
//! established.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};

pub struct TimedStream<S> {
    inner: S,
    read_timeout: Duration,
    write_timeout: Duration,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> TimedStream<S> {
    pub fn new(inner: S, read_timeout: Duration, write_timeout: Duration) -> Self {
        TimedStream {
            inner,
            read_timeout,
            write_timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Replace both windows and drop any armed deadline.
    pub fn set_timeouts(&mut self, read: Duration, write: Duration) {
        self.read_timeout = read;
        self.write_timeout = write;
        self.read_deadline = None;
        self.write_deadline = None;
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{} deadline elapsed", what))
}

impl<S: AsyncRead + Unpin> AsyncRead for TimedStream<S> {
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
            Poll::Pending => {
                if this.read_timeout.is_zero() {
                    return Poll::Pending;
                }
                let deadline = this.read_deadline.get_or_insert_with(|| {
                    Box::pin(sleep_until(Instant::now() + this.read_timeout))
                });
                match deadline.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.read_deadline = None;
                        Poll::Ready(Err(timed_out("read")))
                    }
                    Poll::Pending => Poll::Pending,
                }
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
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if this.write_timeout.is_zero() {
                    return Poll::Pending;
                }
                let deadline = this.write_deadline.get_or_insert_with(|| {
                    Box::pin(sleep_until(Instant::now() + this.write_timeout))
                });
                match deadline.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.write_deadline = None;
                        Poll::Ready(Err(timed_out("write")))
                    }
                    Poll::Pending => Poll::Pending,
                }
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

    #[tokio::test]
    async fn read_times_out_when_peer_is_silent() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut timed = TimedStream::new(
            client,
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        let mut buf = [0u8; 8];
        let err = timed.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        // server side still open; a later write must not panic
        server.write_all(b"late").await.unwrap();
    }

    #[tokio::test]
    async fn deadline_refreshes_per_read() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut timed = TimedStream::new(
            client,
            Duration::from_millis(200),
            Duration::from_millis(200),
        );

        let writer = tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                server.write_all(b"x").await.unwrap();
            }
            server
        });

        // Three reads each inside the window, total elapsed beyond one window.
        let mut buf = [0u8; 1];
        for _ in 0..3 {
            timed.read_exact(&mut buf).await.unwrap();
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn zero_timeout_disables_deadline() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut timed = TimedStream::new(client, Duration::ZERO, Duration::ZERO);
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 5];
            timed.read_exact(&mut buf).await.unwrap();
            buf
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        server.write_all(b"hello").await.unwrap();
        assert_eq!(&reader.await.unwrap(), b"hello");
    }
}
