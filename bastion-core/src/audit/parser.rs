//! Incremental HTTP/1.x message parser.
//!
//! One parser instance exists per (connection, direction). Bytes from the
//! copy path are appended to a rolling buffer; complete messages are cut
//! out as soon as their framing (Content-Length or chunked) closes. The
//! parser never decodes bodies and keeps working across keep-alive and
//! pipelined messages.

use bytes::BytesMut;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMessageKind {
    Request,
    Response,
}

#[derive(Debug, Clone)]
pub struct HttpMessage {
    pub kind: HttpMessageKind,
    pub bytes: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl HttpMessage {
    fn classify(bytes: Vec<u8>) -> Self {
        let kind = if bytes.starts_with(b"HTTP/") {
            HttpMessageKind::Response
        } else {
            HttpMessageKind::Request
        };
        HttpMessage {
            kind,
            bytes,
            timestamp: Utc::now(),
        }
    }
}

pub struct HttpStreamParser {
    buf: BytesMut,
    content_length: i64,
    is_chunked: bool,
    header_complete: bool,
}

/// Locate `needle` in `haystack`, returning the start offset.
fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

impl HttpStreamParser {
    pub fn new() -> Self {
        HttpStreamParser {
            buf: BytesMut::new(),
            content_length: -1,
            is_chunked: false,
            header_complete: false,
        }
    }

    fn reset(&mut self) {
        self.content_length = -1;
        self.is_chunked = false;
        self.header_complete = false;
    }

    /// Append bytes and cut out every message that is now complete.
    pub fn feed(&mut self, data: &[u8]) -> Vec<HttpMessage> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            let Some(header_end) = find(&self.buf, b"\r\n\r\n", 0) else {
                break;
            };
            let body_start = header_end + 4;

            if !self.header_complete {
                self.scan_headers(header_end);
                self.header_complete = true;
            }

            let message_end = if self.is_chunked {
                match chunked_body_end(&self.buf, body_start) {
                    Some(end) => end,
                    None => break,
                }
            } else if self.content_length >= 0 {
                body_start + self.content_length as usize
            } else {
                body_start
            };

            if self.buf.len() < message_end {
                break;
            }

            let bytes = self.buf.split_to(message_end).to_vec();
            self.reset();
            out.push(HttpMessage::classify(bytes));
        }

        out
    }

    /// Emit whatever is buffered as a best-effort partial message. Called
    /// when the connection closes.
    pub fn flush(&mut self) -> Option<HttpMessage> {
        if self.buf.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.buf).to_vec();
        self.reset();
        Some(HttpMessage::classify(bytes))
    }

    fn scan_headers(&mut self, header_end: usize) {
        let header = &self.buf[..header_end];
        for line in header.split(|&b| b == b'\n') {
            let line = match line.last() {
                Some(b'\r') => &line[..line.len() - 1],
                _ => line,
            };
            let Some(colon) = line.iter().position(|&b| b == b':') else {
                continue;
            };
            let name = &line[..colon];
            let value = String::from_utf8_lossy(&line[colon + 1..]);
            let value = value.trim();
            if name.eq_ignore_ascii_case(b"content-length") {
                if let Ok(n) = value.parse::<i64>() {
                    self.content_length = n;
                }
            } else if name.eq_ignore_ascii_case(b"transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
            {
                self.is_chunked = true;
            }
        }
    }
}

impl Default for HttpStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk chunk frames starting at `from`. Returns the index one past the
/// terminating CRLF of the zero chunk, or `None` while the body is short.
fn chunked_body_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut pos = from;
    loop {
        let line_end = find(buf, b"\r\n", pos)?;
        let line = &buf[pos..line_end];
        // chunk extensions follow a ';'
        let size_part = match line.iter().position(|&b| b == b';') {
            Some(i) => &line[..i],
            None => line,
        };
        let size_str = std::str::from_utf8(size_part).ok()?.trim();
        let size = usize::from_str_radix(size_str, 16).ok()?;

        if size == 0 {
            // zero chunk, then the trailing CRLF
            let end = line_end + 2 + 2;
            if buf.len() < end {
                return None;
            }
            return Some(end);
        }

        // data plus its CRLF terminator
        pos = line_end + 2 + size + 2;
        if buf.len() < pos {
            return None;
        }
    }
}
