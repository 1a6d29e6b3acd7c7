//! HTTP forward-proxy front end.
//!
//! Reads exactly one request off the client, then branches: CONNECT
//! becomes a raw tunnel, a WebSocket upgrade is forwarded untouched and
//! then tunneled, and plain requests are rewritten to origin form and
//! relayed with auditing. Parsing is deliberately byte-level; bodies are
//! never interpreted here.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CoreError, Result};

/// Upper bound on a request or response header block.
const MAX_HEADER_BYTES: usize = 64 * 1024;

pub const RESPONSE_400: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
pub const RESPONSE_502: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
pub const RESPONSE_CONNECTED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

#[derive(Debug)]
pub struct ProxyRequest {
    /// The header block as received, including the blank line
    pub raw: Vec<u8>,
    /// Bytes read past the header block (start of the body or tunnel)
    pub leftover: Vec<u8>,
    pub method: String,
    pub target: String,
    pub version: String,
    headers: Vec<(String, String)>,
}

impl ProxyRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// `Upgrade: websocket` plus `Connection: upgrade`, case-insensitive.
    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self
            .header("upgrade")
            .map(|v| v.to_ascii_lowercase().contains("websocket"))
            .unwrap_or(false);
        let connection = self
            .header("connection")
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false);
        upgrade && connection
    }

    /// Resolve the upstream address: the CONNECT authority, or the Host
    /// header with the scheme's default port.
    pub fn upstream_addr(&self) -> Result<(String, u16)> {
        if self.is_connect() {
            return split_host_port(&self.target, 443);
        }
        let default_port = if self.target.to_ascii_lowercase().starts_with("https://") {
            443
        } else {
            80
        };
        let host = self
            .header("host")
            .map(str::to_string)
            .or_else(|| authority_of(&self.target))
            .ok_or_else(|| {
                CoreError::InvalidRequest("http request carries no host".to_string())
            })?;
        split_host_port(&host, default_port)
    }

    /// Rebuild the header block for the upstream: origin-form target and
    /// `Connection: close` (hop-by-hop headers stripped). WebSocket
    /// upgrades are forwarded verbatim instead.
    pub fn forward_bytes(&self) -> Vec<u8> {
        let path = origin_form(&self.target);
        let mut out = Vec::with_capacity(self.raw.len());
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.method, path, self.version).as_bytes(),
        );
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("connection")
                || name.eq_ignore_ascii_case("proxy-connection")
            {
                continue;
            }
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(b"Connection: close\r\n\r\n");
        out
    }
}

/// Strip scheme and authority from an absolute-form request target.
fn origin_form(target: &str) -> String {
    let lower = target.to_ascii_lowercase();
    let rest = if let Some(stripped) = lower.strip_prefix("http://") {
        &target[target.len() - stripped.len()..]
    } else if let Some(stripped) = lower.strip_prefix("https://") {
        &target[target.len() - stripped.len()..]
    } else {
        return target.to_string();
    };
    match rest.find('/') {
        Some(i) => rest[i..].to_string(),
        None => "/".to_string(),
    }
}

fn authority_of(target: &str) -> Option<String> {
    let lower = target.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("http://")
        .or_else(|| lower.strip_prefix("https://"))?;
    let end = rest.find('/').unwrap_or(rest.len());
    let offset = target.len() - rest.len();
    Some(target[offset..offset + end].to_string())
}

fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16)> {
    // bracketed IPv6 literal
    if let Some(rest) = authority.strip_prefix('[') {
        let Some(close) = rest.find(']') else {
            return Err(CoreError::InvalidRequest(format!(
                "bad authority '{}'",
                authority
            )));
        };
        let host = rest[..close].to_string();
        let port = match rest[close + 1..].strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| {
                CoreError::InvalidRequest(format!("bad port in '{}'", authority))
            })?,
            None => default_port,
        };
        return Ok((host, port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port.parse().map_err(|_| {
                CoreError::InvalidRequest(format!("bad port in '{}'", authority))
            })?;
            Ok((host.to_string(), port))
        }
        // plain IPv6 literal or no port at all
        _ => Ok((authority.to_string(), default_port)),
    }
}

/// Read one request header block off the client.
pub async fn read_request<S>(stream: &mut S) -> Result<ProxyRequest>
where
    S: AsyncRead + Unpin,
{
    let (raw, leftover) = read_header_block(stream).await?;

    let header_str = String::from_utf8_lossy(&raw);
    let mut lines = header_str.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(CoreError::InvalidRequest(format!(
            "malformed request line '{}'",
            request_line
        )));
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(ProxyRequest {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
        raw,
        leftover,
    })
}

/// Read a single response message (status line, headers, Content-Length
/// body) from the upstream. Returns `(message, leftover)`.
pub async fn read_one_response<S>(stream: &mut S) -> Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let (mut message, mut leftover) = read_header_block(stream).await?;

    let content_length = crate::audit::store::header_value(&message, "content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    // pull the body over from the leftover plus the wire
    while message.len() < MAX_HEADER_BYTES {
        let missing = content_length.saturating_sub(body_len(&message));
        if missing == 0 {
            break;
        }
        if !leftover.is_empty() {
            let take = missing.min(leftover.len());
            message.extend_from_slice(&leftover[..take]);
            leftover.drain(..take);
            continue;
        }
        let mut chunk = vec![0u8; missing.min(16 * 1024)];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        message.extend_from_slice(&chunk[..n]);
    }

    Ok((message, leftover))
}

fn body_len(message: &[u8]) -> usize {
    message
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| message.len() - (p + 4))
        .unwrap_or(0)
}

/// Accumulate bytes until the blank line. Returns the header block
/// (including the terminator) and any extra bytes already read.
async fn read_header_block<S>(stream: &mut S) -> Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let leftover = buf.split_off(pos + 4);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(CoreError::InvalidRequest(
                "header block exceeds limit".to_string(),
            ));
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(CoreError::InvalidRequest(
                "connection closed before header end".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Best-effort minimal error response; failures only get logged.
pub async fn send_error<S>(stream: &mut S, response: &[u8])
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = stream.write_all(response).await {
        log::debug!("Failed to send error response: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(raw: &[u8]) -> ProxyRequest {
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        read_request(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn parses_absolute_form_get() {
        let req =
            parse(b"GET http://example.com/path?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        assert_eq!(req.method, "GET");
        assert_eq!(req.upstream_addr().unwrap(), ("example.com".to_string(), 80));
        let fwd = String::from_utf8(req.forward_bytes()).unwrap();
        assert!(fwd.starts_with("GET /path?x=1 HTTP/1.1\r\n"));
        assert!(fwd.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn https_scheme_defaults_to_443() {
        let req = parse(b"GET https://example.com/ HTTP/1.1\r\n\r\n").await;
        assert_eq!(req.upstream_addr().unwrap(), ("example.com".to_string(), 443));
    }

    #[tokio::test]
    async fn host_header_port_wins() {
        let req = parse(b"GET /x HTTP/1.1\r\nHost: internal:8080\r\n\r\n").await;
        assert_eq!(req.upstream_addr().unwrap(), ("internal".to_string(), 8080));
    }

    #[tokio::test]
    async fn connect_authority_parses() {
        let req = parse(b"CONNECT db.internal:5432 HTTP/1.1\r\nHost: db.internal:5432\r\n\r\n")
            .await;
        assert!(req.is_connect());
        assert_eq!(
            req.upstream_addr().unwrap(),
            ("db.internal".to_string(), 5432)
        );
    }

    #[tokio::test]
    async fn websocket_upgrade_detected_case_insensitively() {
        let req = parse(
            b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: WebSocket\r\nConnection: keep-alive, Upgrade\r\n\r\n",
        )
        .await;
        assert!(req.is_websocket_upgrade());

        let plain = parse(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: upgrade\r\n\r\n").await;
        assert!(!plain.is_websocket_upgrade());
    }

    #[tokio::test]
    async fn leftover_body_bytes_are_preserved() {
        let req = parse(b"POST /u HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nbody").await;
        assert_eq!(req.leftover, b"body");
        assert!(req.raw.ends_with(b"\r\n\r\n"));
    }

    #[tokio::test]
    async fn malformed_request_line_is_invalid() {
        let mut cursor = std::io::Cursor::new(b"NONSENSE\r\n\r\n".to_vec());
        let err = read_request(&mut cursor).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn connection_headers_are_replaced() {
        let req = parse(
            b"GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\nProxy-Connection: keep-alive\r\n\r\n",
        )
        .await;
        let fwd = String::from_utf8(req.forward_bytes()).unwrap();
        assert!(!fwd.contains("keep-alive"));
        assert_eq!(fwd.matches("Connection:").count(), 1);
    }

    #[tokio::test]
    async fn read_one_response_consumes_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhelloEXTRA".to_vec();
        let mut cursor = std::io::Cursor::new(raw);
        let (message, leftover) = read_one_response(&mut cursor).await.unwrap();
        assert!(message.ends_with(b"hello"));
        assert_eq!(leftover, b"EXTRA");
    }

    #[tokio::test]
    async fn bracketed_ipv6_authority() {
        assert_eq!(
            split_host_port("[::1]:8443", 443).unwrap(),
            ("::1".to_string(), 8443)
        );
        assert_eq!(
            split_host_port("[::1]", 443).unwrap(),
            ("::1".to_string(), 443)
        );
    }
}
