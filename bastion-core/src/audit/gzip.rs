//! On-demand gzip body previews.
//!
//! Stored response bodies are decoded lazily and defensively: output is
//! capped, wall time is capped, and a body that is not actually gzip
//! yields the raw bytes truncated to the cap.

use std::io::Read;
use std::time::{Duration, Instant};

use flate2::read::GzDecoder;
use serde::Serialize;

pub const REASON_MAX_BYTES: &str = "max_bytes";
pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_INVALID_GZIP: &str = "invalid_gzip";
pub const REASON_READ_ERROR: &str = "gzip_read_error";

#[derive(Debug, Clone, Serialize)]
pub struct GzipPreview {
    pub data: Vec<u8>,
    pub truncated: bool,
    pub truncated_reason: Option<String>,
}

/// Decode up to `max_bytes` of plaintext within `timeout` of wall time.
pub fn decode_preview(body: &[u8], max_bytes: usize, timeout: Duration) -> GzipPreview {
    let started = Instant::now();
    let mut decoder = GzDecoder::new(body);
    let mut data = Vec::new();
    let mut chunk = [0u8; 8 * 1024];
    let mut first_read = true;

    loop {
        if started.elapsed() >= timeout {
            return GzipPreview {
                data,
                truncated: true,
                truncated_reason: Some(REASON_TIMEOUT.to_string()),
            };
        }
        let want = chunk.len().min(max_bytes - data.len());
        match decoder.read(&mut chunk[..want.max(1)]) {
            Ok(0) => {
                return GzipPreview {
                    data,
                    truncated: false,
                    truncated_reason: None,
                };
            }
            Ok(n) => {
                let take = n.min(max_bytes - data.len());
                data.extend_from_slice(&chunk[..take]);
                if data.len() >= max_bytes {
                    return GzipPreview {
                        data,
                        truncated: true,
                        truncated_reason: Some(REASON_MAX_BYTES.to_string()),
                    };
                }
            }
            Err(e) => {
                if first_read {
                    // not gzip at all: hand back the raw bytes, capped
                    let cap = body.len().min(max_bytes);
                    return GzipPreview {
                        data: body[..cap].to_vec(),
                        truncated: body.len() > max_bytes,
                        truncated_reason: Some(REASON_INVALID_GZIP.to_string()),
                    };
                }
                log::debug!("gzip preview aborted mid-stream: {}", e);
                return GzipPreview {
                    data,
                    truncated: true,
                    truncated_reason: Some(REASON_READ_ERROR.to_string()),
                };
            }
        }
        first_read = false;
    }
}

/// Reassemble a chunked transfer coding body into plain bytes. Returns the
/// input unchanged when it does not look chunked.
pub fn dechunk(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut pos = 0;

    while pos < body.len() {
        let Some(line_end) = body[pos..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|p| p + pos)
        else {
            return body.to_vec();
        };
        let line = &body[pos..line_end];
        let size_part = match line.iter().position(|&b| b == b';') {
            Some(i) => &line[..i],
            None => line,
        };
        let Some(size) = std::str::from_utf8(size_part)
            .ok()
            .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
        else {
            return body.to_vec();
        };
        if size == 0 {
            break;
        }
        let data_start = line_end + 2;
        let data_end = data_start + size;
        if body.len() < data_end {
            return body.to_vec();
        }
        out.extend_from_slice(&body[data_start..data_end]);
        pos = data_end + 2;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gz(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn full_decode_is_not_truncated() {
        let preview = decode_preview(&gz(b"hello world"), 1024, Duration::from_secs(1));
        assert_eq!(preview.data, b"hello world");
        assert!(!preview.truncated);
        assert!(preview.truncated_reason.is_none());
    }

    #[test]
    fn cap_truncates_with_max_bytes_reason() {
        let preview = decode_preview(&gz(b"hello world"), 5, Duration::from_secs(1));
        assert_eq!(preview.data, b"hello");
        assert!(preview.truncated);
        assert_eq!(preview.truncated_reason.as_deref(), Some(REASON_MAX_BYTES));
    }

    #[test]
    fn non_gzip_input_returns_raw_preview() {
        let preview = decode_preview(b"plain text body", 1024, Duration::from_secs(1));
        assert_eq!(preview.data, b"plain text body");
        assert!(!preview.truncated);
        assert_eq!(
            preview.truncated_reason.as_deref(),
            Some(REASON_INVALID_GZIP)
        );
    }

    #[test]
    fn oversize_non_gzip_input_is_capped() {
        let body = vec![b'x'; 64];
        let preview = decode_preview(&body, 16, Duration::from_secs(1));
        assert_eq!(preview.data.len(), 16);
        assert!(preview.truncated);
        assert_eq!(
            preview.truncated_reason.as_deref(),
            Some(REASON_INVALID_GZIP)
        );
    }

    #[test]
    fn dechunk_reassembles_body() {
        let chunked = b"4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n";
        assert_eq!(dechunk(chunked), b"wikipedia");
    }

    #[test]
    fn dechunk_passes_through_malformed_input() {
        let raw = b"not chunked at all";
        assert_eq!(dechunk(raw), raw);
    }
}
