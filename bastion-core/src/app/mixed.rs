//! Mixed-mode protocol detection.
//!
//! Peeks at most 32 bytes off a fresh connection, classifies them as
//! SOCKS5 or HTTP, and hands the bytes back through a prefix-wrapped
//! stream so the chosen front-end sees the connection from byte zero.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::error::{CoreError, Result};

const PEEK_LIMIT: usize = 32;
const PEEK_DEADLINE: Duration = Duration::from_secs(2);

const HTTP_METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedProtocol {
    Socks5,
    Http,
}

/// Serves the retained peek bytes before reading from the wrapped stream.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> std::fmt::Debug for PrefixedStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefixedStream")
            .field("prefix", &self.prefix)
            .field("pos", &self.pos)
            .finish_non_exhaustive()
    }
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        PrefixedStream {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let take = (this.prefix.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.prefix[this.pos..this.pos + take]);
            this.pos += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

enum Classification {
    Decided(DetectedProtocol),
    NeedMore,
    Unknown,
}

/// Classify peeked bytes after trimming leading ASCII whitespace.
fn classify(peeked: &[u8]) -> Classification {
    let trimmed: &[u8] = match peeked.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(start) => &peeked[start..],
        None => return Classification::NeedMore,
    };

    if trimmed[0] == 0x05 {
        return Classification::Decided(DetectedProtocol::Socks5);
    }

    let upper: Vec<u8> = trimmed
        .iter()
        .take(PEEK_LIMIT)
        .map(|b| b.to_ascii_uppercase())
        .collect();

    if upper.starts_with(b"HTTP/") {
        return Classification::Decided(DetectedProtocol::Http);
    }
    if b"HTTP/".starts_with(&upper[..upper.len().min(5)]) {
        return Classification::NeedMore;
    }

    // leading letter run must spell out a known method
    let token_len = upper
        .iter()
        .position(|b| !b.is_ascii_uppercase())
        .unwrap_or(upper.len());
    let token = &upper[..token_len];
    let token_complete = token_len < upper.len();

    for method in HTTP_METHODS {
        let method = method.as_bytes();
        if token_complete && token == method {
            return Classification::Decided(DetectedProtocol::Http);
        }
        if !token_complete && method.starts_with(token) {
            return Classification::NeedMore;
        }
    }

    Classification::Unknown
}

/// Peek up to 32 bytes under a 2 s deadline and classify. The consumed
/// bytes come back inside the returned [`PrefixedStream`].
pub async fn detect<S>(mut stream: S) -> Result<(DetectedProtocol, PrefixedStream<S>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut peeked = Vec::with_capacity(PEEK_LIMIT);
    let deadline = tokio::time::Instant::now() + PEEK_DEADLINE;

    loop {
        if peeked.len() >= PEEK_LIMIT {
            break;
        }
        let mut chunk = [0u8; PEEK_LIMIT];
        let want = PEEK_LIMIT - peeked.len();
        let n = tokio::time::timeout_at(deadline, stream.read(&mut chunk[..want]))
            .await
            .map_err(|_| CoreError::Timeout("protocol detection read timed out".to_string()))??;
        if n == 0 {
            break;
        }
        peeked.extend_from_slice(&chunk[..n]);

        match classify(&peeked) {
            Classification::Decided(proto) => {
                return Ok((proto, PrefixedStream::new(peeked, stream)));
            }
            Classification::NeedMore => continue,
            Classification::Unknown => break,
        }
    }

    Err(CoreError::InvalidRequest(format!(
        "unrecognized protocol preamble ({} bytes)",
        peeked.len()
    )))
}
