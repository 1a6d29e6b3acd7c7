//! Bounded in-memory log of paired HTTP exchanges.
//!
//! Insertion is O(1) with head eviction once the cap is reached; lookup is
//! O(1) through an id index. Queries filter and paginate newest-first.
//! Response bodies can be previewed with a capped gzip decode whose result
//! is cached with a sliding TTL.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lru::LruCache;
use regex::Regex;
use serde::Serialize;

use crate::error::{CoreError, Result};

use super::gzip::{self, GzipPreview};
use super::parser::HttpMessage;
use super::AuditContext;

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct HttpLog {
    pub id: u64,
    /// Request arrival time
    pub timestamp: DateTime<Utc>,
    pub conn_id: String,
    pub mapping_id: String,
    pub local_port: u16,
    pub bastion_chain: Vec<String>,
    pub method: String,
    pub url: String,
    pub host: String,
    pub protocol: String,
    pub status_code: u16,
    #[serde(skip)]
    pub request_bytes: Vec<u8>,
    #[serde(skip)]
    pub response_bytes: Vec<u8>,
    pub req_size: usize,
    pub resp_size: usize,
    pub is_gzipped: bool,
    pub duration_ms: i64,
}

/// Case-insensitive header lookup inside a raw message.
pub fn header_value<'a>(message: &'a [u8], name: &str) -> Option<String> {
    let header_end = message
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(message.len());
    for line in message[..header_end].split(|&b| b == b'\n') {
        let line = match line.last() {
            Some(b'\r') => &line[..line.len() - 1],
            _ => line,
        };
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        if line[..colon].eq_ignore_ascii_case(name.as_bytes()) {
            return Some(String::from_utf8_lossy(&line[colon + 1..]).trim().to_string());
        }
    }
    None
}

fn request_line(message: &[u8]) -> (String, String, String) {
    let line_end = message
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(message.len());
    let line = String::from_utf8_lossy(&message[..line_end]);
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let url = parts.next().unwrap_or("").to_string();
    let protocol = parts.next().unwrap_or("").to_string();
    (method, url, protocol)
}

fn status_code(response: &[u8]) -> u16 {
    let line_end = response
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(response.len());
    let line = String::from_utf8_lossy(&response[..line_end]);
    line.split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Assemble a log entry from a request and its (possibly missing)
/// response. The id is assigned at insertion time.
pub fn build_log(
    ctx: &AuditContext,
    conn_id: &str,
    request: &HttpMessage,
    response: Option<&HttpMessage>,
) -> HttpLog {
    let (method, url, protocol) = request_line(&request.bytes);
    let host = header_value(&request.bytes, "host").unwrap_or_default();

    let (status, resp_bytes, is_gzipped, duration_ms) = match response {
        Some(resp) => {
            let gz = header_value(&resp.bytes, "content-encoding")
                .map(|v| v.to_ascii_lowercase().contains("gzip"))
                .unwrap_or(false);
            let duration = (resp.timestamp - request.timestamp).num_milliseconds().max(0);
            (status_code(&resp.bytes), resp.bytes.clone(), gz, duration)
        }
        None => (0, Vec::new(), false, 0),
    };

    HttpLog {
        id: 0,
        timestamp: request.timestamp,
        conn_id: conn_id.to_string(),
        mapping_id: ctx.mapping_id.clone(),
        local_port: ctx.local_port,
        bastion_chain: ctx.bastion_chain.clone(),
        method,
        url,
        host,
        protocol,
        status_code: status,
        req_size: request.bytes.len(),
        request_bytes: request.bytes.clone(),
        resp_size: resp_bytes.len(),
        response_bytes: resp_bytes,
        is_gzipped,
        duration_ms,
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub method: Option<String>,
    pub host: Option<String>,
    pub url: Option<String>,
    pub bastion: Option<String>,
    pub local_port: Option<u16>,
    pub status_code: Option<u16>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Substring, or regular expression when it compiles
    pub q: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPart {
    RequestHeader,
    RequestBody,
    ResponseHeader,
    ResponseBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartPreview {
    pub data: Vec<u8>,
    pub truncated: bool,
    pub truncated_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_logs: usize,
    pub gzip_max_bytes: usize,
    pub gzip_timeout: Duration,
    pub cache_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            max_logs: 1000,
            gzip_max_bytes: 1_048_576,
            gzip_timeout: Duration::from_millis(500),
            cache_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreMetrics {
    pub stored: usize,
    pub total_seen: u64,
    pub capacity: usize,
}

struct StoreInner {
    logs: VecDeque<u64>,
    index: HashMap<u64, HttpLog>,
    next_id: u64,
    total_seen: u64,
}

struct CachedPreview {
    preview: GzipPreview,
    expires_at: Instant,
}

struct PreviewCache {
    entries: LruCache<u64, CachedPreview>,
    last_sweep: Instant,
}

pub struct HttpLogStore {
    cfg: StoreConfig,
    inner: RwLock<StoreInner>,
    cache: Mutex<PreviewCache>,
}

impl HttpLogStore {
    pub fn new(cfg: StoreConfig) -> Self {
        let cache_cap = NonZeroUsize::new(cfg.max_logs.max(1)).expect("nonzero cap");
        HttpLogStore {
            cfg,
            inner: RwLock::new(StoreInner {
                logs: VecDeque::new(),
                index: HashMap::new(),
                next_id: 1,
                total_seen: 0,
            }),
            cache: Mutex::new(PreviewCache {
                entries: LruCache::new(cache_cap),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Insert at the tail, evicting the oldest entry once full. Returns
    /// the assigned id.
    pub fn insert(&self, mut log: HttpLog) -> u64 {
        let (id, evicted) = {
            let mut inner = self.inner.write().expect("store lock poisoned");
            let id = inner.next_id;
            inner.next_id += 1;
            inner.total_seen += 1;
            log.id = id;
            inner.logs.push_back(id);
            inner.index.insert(id, log);

            let evicted = if inner.logs.len() > self.cfg.max_logs {
                let old = inner.logs.pop_front().expect("non-empty ring");
                inner.index.remove(&old);
                Some(old)
            } else {
                None
            };
            (id, evicted)
        };

        if let Some(old) = evicted {
            self.cache.lock().expect("cache lock poisoned").entries.pop(&old);
        }
        id
    }

    pub fn get_by_id(&self, id: u64) -> Option<HttpLog> {
        self.inner
            .read()
            .expect("store lock poisoned")
            .index
            .get(&id)
            .cloned()
    }

    /// Filter and paginate, newest first. `page` is 1-indexed.
    pub fn query(&self, query: &LogQuery, page: usize, page_size: usize) -> (Vec<HttpLog>, usize) {
        let regex = query
            .q
            .as_deref()
            .filter(|q| !q.is_empty())
            .and_then(|q| Regex::new(q).ok());

        let inner = self.inner.read().expect("store lock poisoned");
        let matched: Vec<&HttpLog> = inner
            .logs
            .iter()
            .rev()
            .filter_map(|id| inner.index.get(id))
            .filter(|log| self.matches(log, query, regex.as_ref()))
            .collect();

        let total = matched.len();
        let page = page.max(1);
        let page_size = page_size.max(1);
        let start = (page - 1) * page_size;
        let items = matched
            .into_iter()
            .skip(start)
            .take(page_size)
            .cloned()
            .collect();
        (items, total)
    }

    fn matches(&self, log: &HttpLog, query: &LogQuery, regex: Option<&Regex>) -> bool {
        if let Some(method) = &query.method {
            if !log.method.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(host) = &query.host {
            if !log.host.to_lowercase().contains(&host.to_lowercase()) {
                return false;
            }
        }
        if let Some(url) = &query.url {
            if !log.url.contains(url.as_str()) {
                return false;
            }
        }
        if let Some(bastion) = &query.bastion {
            if !log
                .bastion_chain
                .iter()
                .any(|b| b.eq_ignore_ascii_case(bastion))
            {
                return false;
            }
        }
        if let Some(port) = query.local_port {
            if log.local_port != port {
                return false;
            }
        }
        if let Some(status) = query.status_code {
            if status != 0 && log.status_code != status {
                return false;
            }
        }
        if let Some(since) = query.since {
            if log.timestamp < since {
                return false;
            }
        }
        if let Some(until) = query.until {
            if log.timestamp > until {
                return false;
            }
        }
        if let Some(q) = query.q.as_deref().filter(|q| !q.is_empty()) {
            return self.text_matches(log, q, regex);
        }
        true
    }

    /// Free-text search over everything a log carries, including the
    /// decoded response preview when one is cached.
    fn text_matches(&self, log: &HttpLog, q: &str, regex: Option<&Regex>) -> bool {
        let decoded = {
            let cache = self.cache.lock().expect("cache lock poisoned");
            cache
                .entries
                .peek(&log.id)
                .map(|c| String::from_utf8_lossy(&c.preview.data).to_string())
        };

        let mut haystacks: Vec<String> = vec![
            log.method.clone(),
            log.mapping_id.clone(),
            log.bastion_chain.join("->"),
            log.local_port.to_string(),
            log.host.clone(),
            log.url.clone(),
            log.protocol.clone(),
            log.conn_id.clone(),
            String::from_utf8_lossy(&log.request_bytes).to_string(),
            String::from_utf8_lossy(&log.response_bytes).to_string(),
        ];
        if let Some(decoded) = decoded {
            haystacks.push(decoded);
        }

        match regex {
            Some(re) => haystacks.iter().any(|h| re.is_match(h)),
            None => {
                let q = q.to_lowercase();
                haystacks.iter().any(|h| h.to_lowercase().contains(&q))
            }
        }
    }

    /// Extract one half of a stored message. Gzip decoding is only
    /// meaningful for the response body.
    pub fn get_part(&self, id: u64, part: LogPart, decode_gzip: bool) -> Result<PartPreview> {
        let log = self
            .get_by_id(id)
            .ok_or_else(|| CoreError::NotFound(format!("http log {}", id)))?;

        if decode_gzip && part != LogPart::ResponseBody {
            return Err(CoreError::InvalidRequest(
                "gzip decode is only supported for response_body".to_string(),
            ));
        }

        let (message, want_header) = match part {
            LogPart::RequestHeader => (&log.request_bytes, true),
            LogPart::RequestBody => (&log.request_bytes, false),
            LogPart::ResponseHeader => (&log.response_bytes, true),
            LogPart::ResponseBody => (&log.response_bytes, false),
        };

        let split = message
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|p| p + 4)
            .unwrap_or(message.len());
        let data = if want_header {
            message[..split.min(message.len())].to_vec()
        } else {
            message[split.min(message.len())..].to_vec()
        };

        if !decode_gzip {
            return Ok(PartPreview {
                data,
                truncated: false,
                truncated_reason: None,
            });
        }

        let preview = self.gzip_preview(&log, data)?;
        Ok(PartPreview {
            data: preview.data,
            truncated: preview.truncated,
            truncated_reason: preview.truncated_reason,
        })
    }

    fn gzip_preview(&self, log: &HttpLog, body: Vec<u8>) -> Result<GzipPreview> {
        let encoding = header_value(&log.response_bytes, "content-encoding")
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_default();
        if !encoding.contains("gzip") {
            return Err(CoreError::InvalidRequest(
                "response is not gzip encoded".to_string(),
            ));
        }

        let use_cache = !self.cfg.cache_ttl.is_zero();
        if use_cache {
            let mut cache = self.cache.lock().expect("cache lock poisoned");
            self.sweep_cache(&mut cache);
            if let Some(entry) = cache.entries.get_mut(&log.id) {
                if entry.expires_at > Instant::now() {
                    entry.expires_at = Instant::now() + self.cfg.cache_ttl;
                    return Ok(entry.preview.clone());
                }
                cache.entries.pop(&log.id);
            }
        }

        let body = if header_value(&log.response_bytes, "transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
        {
            gzip::dechunk(&body)
        } else {
            body
        };

        let preview = gzip::decode_preview(&body, self.cfg.gzip_max_bytes, self.cfg.gzip_timeout);

        if use_cache {
            let mut cache = self.cache.lock().expect("cache lock poisoned");
            cache.entries.put(
                log.id,
                CachedPreview {
                    preview: preview.clone(),
                    expires_at: Instant::now() + self.cfg.cache_ttl,
                },
            );
        }

        Ok(preview)
    }

    /// Best-effort expiry sweep, rate limited to once per interval.
    fn sweep_cache(&self, cache: &mut PreviewCache) {
        let now = Instant::now();
        if now.duration_since(cache.last_sweep) < CACHE_SWEEP_INTERVAL {
            return;
        }
        cache.last_sweep = now;
        let expired: Vec<u64> = cache
            .entries
            .iter()
            .filter(|(_, c)| c.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            cache.entries.pop(&id);
        }
    }

    /// Drop every log and invalidate the preview cache.
    pub fn clear(&self) {
        {
            let mut inner = self.inner.write().expect("store lock poisoned");
            inner.logs.clear();
            inner.index.clear();
        }
        self.cache.lock().expect("cache lock poisoned").entries.clear();
    }

    pub fn metrics(&self) -> StoreMetrics {
        let inner = self.inner.read().expect("store lock poisoned");
        StoreMetrics {
            stored: inner.logs.len(),
            total_seen: inner.total_seen,
            capacity: self.cfg.max_logs,
        }
    }

    #[cfg(test)]
    pub fn cached_preview_count(&self) -> usize {
        self.cache.lock().unwrap().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::parser::{HttpMessage, HttpMessageKind};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn ctx() -> AuditContext {
        AuditContext {
            mapping_id: "m1".to_string(),
            local_port: 23128,
            bastion_chain: vec!["edge".to_string()],
        }
    }

    fn request(url: &str) -> HttpMessage {
        HttpMessage {
            kind: HttpMessageKind::Request,
            bytes: format!("GET {} HTTP/1.1\r\nHost: example.com\r\n\r\n", url).into_bytes(),
            timestamp: Utc::now(),
        }
    }

    fn response(body: &[u8], extra_headers: &str) -> HttpMessage {
        let mut bytes = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}\r\n",
            body.len(),
            extra_headers
        )
        .into_bytes();
        bytes.extend_from_slice(body);
        HttpMessage {
            kind: HttpMessageKind::Response,
            bytes,
            timestamp: Utc::now(),
        }
    }

    fn store_with(max_logs: usize) -> HttpLogStore {
        HttpLogStore::new(StoreConfig {
            max_logs,
            ..Default::default()
        })
    }

    fn insert_pair(store: &HttpLogStore, url: &str) -> u64 {
        let req = request(url);
        let resp = response(b"hello", "");
        store.insert(build_log(&ctx(), "c1->u1", &req, Some(&resp)))
    }

    #[test]
    fn build_log_extracts_request_and_status_fields() {
        let req = request("/a/b");
        let resp = response(b"hello", "");
        let log = build_log(&ctx(), "c->u", &req, Some(&resp));
        assert_eq!(log.method, "GET");
        assert_eq!(log.url, "/a/b");
        assert_eq!(log.host, "example.com");
        assert_eq!(log.protocol, "HTTP/1.1");
        assert_eq!(log.status_code, 200);
        assert!(!log.is_gzipped);
        assert!(log.req_size > 0);
        assert!(log.resp_size >= 34);
    }

    #[test]
    fn unpaired_log_has_zero_status_and_duration() {
        let log = build_log(&ctx(), "c->u", &request("/"), None);
        assert_eq!(log.status_code, 0);
        assert_eq!(log.duration_ms, 0);
        assert_eq!(log.resp_size, 0);
    }

    #[test]
    fn ring_evicts_oldest_and_keeps_index_consistent() {
        let store = store_with(3);
        let first = insert_pair(&store, "/1");
        for i in 2..=4 {
            insert_pair(&store, &format!("/{}", i));
        }
        assert_eq!(store.metrics().stored, 3);
        assert!(store.get_by_id(first).is_none());
        let (items, total) = store.query(&LogQuery::default(), 1, 10);
        assert_eq!(total, 3);
        // newest first
        assert_eq!(items[0].url, "/4");
        assert_eq!(items[2].url, "/2");
    }

    #[test]
    fn ids_are_monotone_and_never_reused() {
        let store = store_with(2);
        let a = insert_pair(&store, "/a");
        let b = insert_pair(&store, "/b");
        let c = insert_pair(&store, "/c");
        assert!(a < b && b < c);
    }

    #[test]
    fn query_filters_compose() {
        let store = store_with(10);
        insert_pair(&store, "/widgets");
        insert_pair(&store, "/gadgets");

        let (items, total) = store.query(
            &LogQuery {
                url: Some("widg".to_string()),
                ..Default::default()
            },
            1,
            10,
        );
        assert_eq!(total, 1);
        assert_eq!(items[0].url, "/widgets");

        let (_, total) = store.query(
            &LogQuery {
                method: Some("get".to_string()),
                bastion: Some("EDGE".to_string()),
                local_port: Some(23128),
                ..Default::default()
            },
            1,
            10,
        );
        assert_eq!(total, 2);

        let (_, total) = store.query(
            &LogQuery {
                status_code: Some(404),
                ..Default::default()
            },
            1,
            10,
        );
        assert_eq!(total, 0);
    }

    #[test]
    fn free_text_search_supports_regex() {
        let store = store_with(10);
        insert_pair(&store, "/v1/users/42");
        insert_pair(&store, "/health");

        let (_, total) = store.query(
            &LogQuery {
                q: Some(r"/v\d+/users/\d+".to_string()),
                ..Default::default()
            },
            1,
            10,
        );
        assert_eq!(total, 1);

        // substring fallback for an invalid pattern
        insert_pair(&store, "/items(1)");
        let (items, total) = store.query(
            &LogQuery {
                q: Some("items(1".to_string()),
                ..Default::default()
            },
            1,
            10,
        );
        assert_eq!(total, 1);
        assert_eq!(items[0].url, "/items(1)");
    }

    #[test]
    fn pagination_is_one_indexed() {
        let store = store_with(10);
        for i in 0..5 {
            insert_pair(&store, &format!("/{}", i));
        }
        let (page1, total) = store.query(&LogQuery::default(), 1, 2);
        let (page3, _) = store.query(&LogQuery::default(), 3, 2);
        assert_eq!(total, 5);
        assert_eq!(page1.len(), 2);
        assert_eq!(page3.len(), 1);
    }

    #[test]
    fn part_extraction_splits_on_header_boundary() {
        let store = store_with(10);
        let id = insert_pair(&store, "/p");
        let header = store.get_part(id, LogPart::ResponseHeader, false).unwrap();
        assert!(header.data.ends_with(b"\r\n\r\n"));
        let body = store.get_part(id, LogPart::ResponseBody, false).unwrap();
        assert_eq!(body.data, b"hello");
        let req_body = store.get_part(id, LogPart::RequestBody, false).unwrap();
        assert!(req_body.data.is_empty());
    }

    #[test]
    fn decode_rejected_for_non_body_parts() {
        let store = store_with(10);
        let id = insert_pair(&store, "/p");
        let err = store.get_part(id, LogPart::RequestHeader, true).unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));
    }

    #[test]
    fn gzip_preview_respects_max_bytes() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"hello world").unwrap();
        let gz_body = enc.finish().unwrap();

        let store = HttpLogStore::new(StoreConfig {
            max_logs: 10,
            gzip_max_bytes: 5,
            ..Default::default()
        });
        let req = request("/z");
        let resp = response(&gz_body, "Content-Encoding: gzip\r\n");
        let id = store.insert(build_log(&ctx(), "c->u", &req, Some(&resp)));

        let preview = store.get_part(id, LogPart::ResponseBody, true).unwrap();
        assert_eq!(preview.data, b"hello");
        assert!(preview.truncated);
        assert_eq!(preview.truncated_reason.as_deref(), Some("max_bytes"));
    }

    #[test]
    fn gzip_preview_requires_encoding_header() {
        let store = store_with(10);
        let id = insert_pair(&store, "/p");
        let err = store.get_part(id, LogPart::ResponseBody, true).unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));
    }

    #[test]
    fn preview_cache_serves_identical_bytes_and_clears() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"cached body").unwrap();
        let gz_body = enc.finish().unwrap();

        let store = store_with(10);
        let req = request("/c");
        let resp = response(&gz_body, "Content-Encoding: gzip\r\n");
        let id = store.insert(build_log(&ctx(), "c->u", &req, Some(&resp)));

        let one = store.get_part(id, LogPart::ResponseBody, true).unwrap();
        assert_eq!(store.cached_preview_count(), 1);
        let two = store.get_part(id, LogPart::ResponseBody, true).unwrap();
        assert_eq!(one.data, two.data);

        store.clear();
        assert_eq!(store.cached_preview_count(), 0);
        assert_eq!(store.metrics().stored, 0);
    }
}
