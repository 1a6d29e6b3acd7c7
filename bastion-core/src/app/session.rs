//! Session lifecycle: one listener per mapping, admission, per-protocol
//! handling and the bidirectional copy engine.
//!
//! Every accepted connection runs in its own task; a panicking handler is
//! reported and reaped without touching its siblings. The copy path is
//! the hot loop: pooled buffers, per-op deadlines, atomic byte counters
//! and optional audit taps.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::audit::parser::{HttpMessage, HttpMessageKind, HttpStreamParser};
use crate::audit::{self, AuditContext, AuditEvent, Auditor};
use crate::config::Settings;
use crate::error::{CoreError, Result};
use crate::service::registry;
use crate::ssh::chain::{AsyncStream, BoxedStream};
use crate::ssh::pool::SshPool;
use crate::store::{Bastion, ConfigStore, Mapping, MappingType};
use crate::system::acl::IpAcl;
use crate::system::buffer_pool::{BufferPool, COPY_BUFFERS};
use crate::system::deadline::TimedStream;
use crate::system::diagnostics;

/// Grace period for handler tasks after stop is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const TCP_DIAL_ATTEMPTS: u32 = 3;
const TCP_DIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Request,
    Response,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub active_conns: i64,
}

pub struct Session {
    mapping: Mapping,
    bastions: Vec<Bastion>,
    acl: Option<IpAcl>,
    settings: Settings,
    pool: Arc<SshPool>,
    auditor: Option<Arc<Auditor>>,
    audit_ctx: AuditContext,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    active_conns: AtomicI64,
    parsers: Mutex<HashMap<String, Arc<Mutex<HttpStreamParser>>>>,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("mapping", &self.mapping)
            .finish_non_exhaustive()
    }
}

/// Start a mapping: resolve its chain, bind the listener, register the
/// session and launch the accept loop.
pub async fn start(
    store: &Arc<dyn ConfigStore>,
    pool: Arc<SshPool>,
    mapping_id: &str,
) -> Result<Arc<Session>> {
    if registry::exists(mapping_id).await {
        return Err(CoreError::conflict(format!(
            "mapping '{}' is already running",
            mapping_id
        )));
    }

    let mapping = store.get_mapping(mapping_id).await?;
    if mapping.mapping_type == MappingType::Tcp && mapping.remote_host.is_empty() {
        return Err(CoreError::InvalidRequest(format!(
            "mapping '{}' is tcp but has no remote address",
            mapping.id
        )));
    }

    let bastions = store.list_bastions_by_names(&mapping.chain).await?;
    let acl = IpAcl::from_rules(&mapping.allow_cidrs, &mapping.deny_cidrs)?;
    let settings = Settings::current();

    let local_addr = mapping.local_addr();
    let listener = match TcpListener::bind(&local_addr).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            let diagnostics = diagnostics::collect_bind_diagnostics(
                store.as_ref(),
                &mapping.id,
                &local_addr,
                mapping.local_port,
                &e,
            )
            .await;
            return Err(CoreError::Conflict {
                message: format!("address {} is already in use", local_addr),
                diagnostics: Some(diagnostics),
            });
        }
        Err(e) => return Err(e.into()),
    };

    let auditor = if settings.audit_enabled {
        audit::global()
    } else {
        None
    };

    let session = Arc::new(Session {
        audit_ctx: AuditContext {
            mapping_id: mapping.id.clone(),
            local_port: mapping.local_port,
            bastion_chain: mapping.chain.clone(),
        },
        mapping,
        bastions,
        acl,
        settings,
        pool,
        auditor,
        bytes_up: AtomicU64::new(0),
        bytes_down: AtomicU64::new(0),
        active_conns: AtomicI64::new(0),
        parsers: Mutex::new(HashMap::new()),
        shutdown: CancellationToken::new(),
        accept_task: Mutex::new(None),
    });

    registry::add(Arc::clone(&session)).await?;

    let task = tokio::spawn(Arc::clone(&session).accept_loop(listener));
    *session.accept_task.lock().expect("accept task slot poisoned") = Some(task);

    log::info!(
        "Session '{}' listening on {} ({:?})",
        session.mapping.id,
        local_addr,
        session.mapping.mapping_type
    );
    Ok(session)
}

impl Session {
    pub fn mapping_id(&self) -> &str {
        &self.mapping.id
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            active_conns: self.active_conns.load(Ordering::Relaxed),
        }
    }

    /// Signal the accept loop, then wait out the bounded handler drain.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.accept_task.lock().expect("accept task slot poisoned").take();
        if let Some(task) = task {
            let grace = SHUTDOWN_GRACE + Duration::from_secs(1);
            if tokio::time::timeout(grace, task).await.is_err() {
                log::warn!("Session '{}' shutdown timed out", self.mapping.id);
            }
        }
        log::info!("Session '{}' stopped", self.mapping.id);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(&mut handlers, stream, peer),
                    Err(e) => {
                        log::error!("Session '{}' accept failed: {}", self.mapping.id, e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            // reap finished handlers so the set stays small
            while let Some(finished) = handlers.try_join_next() {
                report_handler_exit(&self.mapping.id, finished);
            }
        }

        // stop accepting immediately; the drain below is time-bounded
        drop(listener);
        let deadline = tokio::time::sleep(SHUTDOWN_GRACE);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    log::warn!(
                        "Session '{}' forcing {} handler task(s) down",
                        self.mapping.id,
                        handlers.len()
                    );
                    handlers.abort_all();
                    while handlers.join_next().await.is_some() {}
                    break;
                }
                joined = handlers.join_next() => match joined {
                    Some(finished) => report_handler_exit(&self.mapping.id, finished),
                    None => break,
                }
            }
        }
    }

    fn admit(self: &Arc<Self>, handlers: &mut JoinSet<()>, stream: TcpStream, peer: SocketAddr) {
        if let Some(acl) = &self.acl {
            if !acl.permits(peer.ip()) {
                log::warn!("Session '{}' denied {} by ACL", self.mapping.id, peer);
                return;
            }
        }

        let active = self.active_conns.load(Ordering::Relaxed);
        if active >= self.settings.max_session_connections as i64 {
            log::warn!(
                "Session '{}' at connection cap ({}), closing {}",
                self.mapping.id,
                self.settings.max_session_connections,
                peer
            );
            return;
        }

        self.active_conns.fetch_add(1, Ordering::Relaxed);
        let session = Arc::clone(self);
        handlers.spawn(async move {
            let _guard = ConnGuard {
                session: Arc::clone(&session),
            };
            if let Err(e) = session.handle_conn(stream, peer).await {
                log::debug!(
                    "Session '{}' connection from {} ended: {}",
                    session.mapping.id,
                    peer,
                    e
                );
            }
        });
    }

    async fn handle_conn(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        match self.mapping.mapping_type {
            MappingType::Tcp => self.handle_tcp(stream, peer).await,
            MappingType::Socks5 => self.handle_socks5(stream, peer).await,
            MappingType::Http => self.handle_http(stream, peer).await,
            MappingType::Mixed => self.handle_mixed(stream, peer).await,
        }
    }

    async fn handle_tcp(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let host = self.mapping.remote_host.clone();
        let port = self.mapping.remote_port;
        let upstream = self.dial_upstream_with_retry(&host, port).await?;
        let conn_id = conn_id(peer, &host, port);

        let client = TimedStream::new(
            stream,
            self.settings.transfer_read_timeout(),
            self.settings.transfer_write_timeout(),
        );
        let upstream = TimedStream::new(
            upstream,
            self.settings.transfer_read_timeout(),
            self.settings.transfer_write_timeout(),
        );
        self.pipe(client, upstream, conn_id, self.audit_enabled())
            .await;
        Ok(())
    }

    async fn handle_socks5<S>(self: &Arc<Self>, stream: S, peer: SocketAddr) -> Result<()>
    where
        S: AsyncStream + 'static,
    {
        let mut client = TimedStream::new(
            stream,
            self.settings.handshake_read_timeout(),
            self.settings.handshake_write_timeout(),
        );

        let (host, port) = super::socks5::read_connect(&mut client).await?;
        log::debug!(
            "Session '{}' socks5 {} -> {}:{}",
            self.mapping.id,
            peer,
            host,
            port
        );

        let upstream = match self.dial_upstream(&host, port).await {
            Ok(upstream) => upstream,
            Err(e) => {
                let _ = client.write_all(&super::socks5::REPLY_FAILURE).await;
                return Err(e);
            }
        };
        client.write_all(&super::socks5::REPLY_SUCCESS).await?;

        client.set_timeouts(
            self.settings.transfer_read_timeout(),
            self.settings.transfer_write_timeout(),
        );
        let upstream = TimedStream::new(
            upstream,
            self.settings.transfer_read_timeout(),
            self.settings.transfer_write_timeout(),
        );
        self.pipe(
            client,
            upstream,
            conn_id(peer, &host, port),
            self.audit_enabled(),
        )
        .await;
        Ok(())
    }

    async fn handle_http<S>(self: &Arc<Self>, stream: S, peer: SocketAddr) -> Result<()>
    where
        S: AsyncStream + 'static,
    {
        let mut client = TimedStream::new(
            stream,
            self.settings.handshake_read_timeout(),
            self.settings.handshake_write_timeout(),
        );

        let request = match super::http::read_request(&mut client).await {
            Ok(request) => request,
            Err(e) => {
                super::http::send_error(&mut client, super::http::RESPONSE_400).await;
                return Err(e);
            }
        };
        let (host, port) = match request.upstream_addr() {
            Ok(target) => target,
            Err(e) => {
                super::http::send_error(&mut client, super::http::RESPONSE_400).await;
                return Err(e);
            }
        };
        let conn_id = conn_id(peer, &host, port);

        let mut upstream = match self.dial_upstream(&host, port).await {
            Ok(upstream) => upstream,
            Err(e) => {
                super::http::send_error(&mut client, super::http::RESPONSE_502).await;
                return Err(e);
            }
        };

        let transfer = (
            self.settings.transfer_read_timeout(),
            self.settings.transfer_write_timeout(),
        );

        if request.is_connect() {
            client.write_all(super::http::RESPONSE_CONNECTED).await?;
            if !request.leftover.is_empty() {
                upstream.write_all(&request.leftover).await?;
            }
            client.set_timeouts(transfer.0, transfer.1);
            let upstream = TimedStream::new(upstream, transfer.0, transfer.1);
            // tunneled bytes are opaque; no audit tap
            self.pipe(client, upstream, conn_id, false).await;
            return Ok(());
        }

        if request.is_websocket_upgrade() {
            upstream.write_all(&request.raw).await?;
            if !request.leftover.is_empty() {
                upstream.write_all(&request.leftover).await?;
            }
            let (response, response_leftover) = tokio::time::timeout(
                self.settings.handshake_read_timeout(),
                super::http::read_one_response(&mut upstream),
            )
            .await
            .map_err(|_| {
                CoreError::Timeout(format!("upgrade response from {}:{} timed out", host, port))
            })??;
            client.write_all(&response).await?;

            // the handshake is the only audited exchange on this connection
            self.audit_handshake_pair(&conn_id, &request.raw, &response);

            if !response_leftover.is_empty() {
                client.write_all(&response_leftover).await?;
            }
            client.set_timeouts(transfer.0, transfer.1);
            let upstream = TimedStream::new(upstream, transfer.0, transfer.1);
            self.pipe(client, upstream, conn_id, false).await;
            return Ok(());
        }

        // plain HTTP: origin-form rewrite, Connection: close, audited relay
        let outgoing = request.forward_bytes();
        upstream.write_all(&outgoing).await?;
        if !request.leftover.is_empty() {
            upstream.write_all(&request.leftover).await?;
        }
        let audit = self.audit_enabled();
        if audit {
            self.feed_parser(&conn_id, Direction::Request, &outgoing);
            if !request.leftover.is_empty() {
                self.feed_parser(&conn_id, Direction::Request, &request.leftover);
            }
        }

        client.set_timeouts(transfer.0, transfer.1);
        let upstream = TimedStream::new(upstream, transfer.0, transfer.1);
        self.pipe(client, upstream, conn_id, audit).await;
        Ok(())
    }

    async fn handle_mixed(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let (proto, wrapped) = super::mixed::detect(stream).await?;
        log::debug!(
            "Session '{}' classified {} as {:?}",
            self.mapping.id,
            peer,
            proto
        );
        match proto {
            super::mixed::DetectedProtocol::Socks5 => self.handle_socks5(wrapped, peer).await,
            super::mixed::DetectedProtocol::Http => self.handle_http(wrapped, peer).await,
        }
    }

    /// Direct dial when the chain is empty, pooled SSH tunnel otherwise.
    async fn dial_upstream(&self, host: &str, port: u16) -> Result<BoxedStream> {
        if self.bastions.is_empty() {
            let connect_timeout = Duration::from_secs(self.settings.ssh_connect_timeout_seconds);
            let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
                .await
                .map_err(|_| {
                    CoreError::Timeout(format!("dial to {}:{} timed out", host, port))
                })?
                .map_err(|e| {
                    CoreError::UpstreamFailure(format!("dial to {}:{} failed: {}", host, port, e))
                })?;
            Ok(Box::new(tcp))
        } else {
            let tunnel = self.pool.dial(&self.bastions, host, port).await?;
            Ok(Box::new(tunnel))
        }
    }

    async fn dial_upstream_with_retry(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let mut last_err = None;
        for attempt in 1..=TCP_DIAL_ATTEMPTS {
            match self.dial_upstream(host, port).await {
                Ok(upstream) => return Ok(upstream),
                Err(e) => {
                    log::warn!(
                        "Session '{}' upstream dial {}/{} failed: {}",
                        self.mapping.id,
                        attempt,
                        TCP_DIAL_ATTEMPTS,
                        e
                    );
                    last_err = Some(e);
                    if attempt < TCP_DIAL_ATTEMPTS {
                        tokio::time::sleep(TCP_DIAL_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            CoreError::UpstreamFailure(format!("dial to {}:{} failed", host, port))
        }))
    }

    /// Run both copiers; whichever exits first tears the pair down. Once
    /// both are done, trailing partial messages are flushed to the audit
    /// queue.
    async fn pipe<C, U>(self: &Arc<Self>, client: C, upstream: U, conn_id: String, audit: bool)
    where
        C: AsyncStream + 'static,
        U: AsyncStream + 'static,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (upstream_read, upstream_write) = tokio::io::split(upstream);
        let token = CancellationToken::new();

        let up = tokio::spawn(Arc::clone(self).copy_data(
            client_read,
            upstream_write,
            Direction::Request,
            conn_id.clone(),
            audit,
            token.clone(),
        ));
        let down = tokio::spawn(Arc::clone(self).copy_data(
            upstream_read,
            client_write,
            Direction::Response,
            conn_id.clone(),
            audit,
            token,
        ));

        for task in [up, down] {
            if let Err(e) = task.await {
                if e.is_panic() {
                    log::error!("Session '{}' copier panicked: {}", self.mapping.id, e);
                }
            }
        }

        if audit {
            self.flush_parsers(&conn_id);
        }
        self.drop_parsers(&conn_id);
    }

    async fn copy_data<R, W>(
        self: Arc<Self>,
        mut src: ReadHalf<R>,
        mut dst: WriteHalf<W>,
        direction: Direction,
        conn_id: String,
        audit: bool,
        token: CancellationToken,
    ) where
        R: AsyncStream,
        W: AsyncStream,
    {
        let mut buf = COPY_BUFFERS.get(self.settings.forward_buffer_size);

        loop {
            let n = tokio::select! {
                _ = token.cancelled() => break,
                read = src.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        log::debug!(
                            "Session '{}' {} read ended: {}",
                            self.mapping.id,
                            direction.as_str(),
                            e
                        );
                        break;
                    }
                }
            };

            if let Err(e) = dst.write_all(&buf[..n]).await {
                log::debug!(
                    "Session '{}' {} write failed: {}",
                    self.mapping.id,
                    direction.as_str(),
                    e
                );
                break;
            }

            match direction {
                Direction::Request => self.bytes_up.fetch_add(n as u64, Ordering::Relaxed),
                Direction::Response => self.bytes_down.fetch_add(n as u64, Ordering::Relaxed),
            };

            if audit {
                self.feed_parser(&conn_id, direction, &buf[..n]);
            }

            // a full read suggests more is coming; move up a buffer class
            if n == buf.len() {
                let next = BufferPool::next_size(buf.len());
                if next > buf.len() {
                    COPY_BUFFERS.put(buf);
                    buf = COPY_BUFFERS.get(next);
                }
            }
        }

        token.cancel();
        let _ = dst.shutdown().await;
        COPY_BUFFERS.put(buf);
    }

    fn audit_enabled(&self) -> bool {
        self.settings.audit_enabled && self.auditor.is_some()
    }

    fn parser_for(&self, conn_id: &str, direction: Direction) -> Arc<Mutex<HttpStreamParser>> {
        let key = format!("{}|{}", conn_id, direction.as_str());
        let mut parsers = self.parsers.lock().expect("parser map poisoned");
        Arc::clone(
            parsers
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(HttpStreamParser::new()))),
        )
    }

    /// Feed copied bytes through this direction's parser and enqueue every
    /// completed message. The map lock is not held while parsing.
    fn feed_parser(&self, conn_id: &str, direction: Direction, data: &[u8]) {
        let Some(auditor) = &self.auditor else {
            return;
        };
        let parser = self.parser_for(conn_id, direction);
        let messages = parser.lock().expect("parser poisoned").feed(data);
        for message in messages {
            auditor.enqueue(AuditEvent {
                ctx: self.audit_ctx.clone(),
                conn_id: conn_id.to_string(),
                message,
            });
        }
    }

    fn flush_parsers(&self, conn_id: &str) {
        let Some(auditor) = &self.auditor else {
            return;
        };
        for direction in [Direction::Request, Direction::Response] {
            let key = format!("{}|{}", conn_id, direction.as_str());
            let parser = {
                let parsers = self.parsers.lock().expect("parser map poisoned");
                parsers.get(&key).cloned()
            };
            let Some(parser) = parser else { continue };
            if let Some(message) = parser.lock().expect("parser poisoned").flush() {
                auditor.enqueue(AuditEvent {
                    ctx: self.audit_ctx.clone(),
                    conn_id: conn_id.to_string(),
                    message,
                });
            };
        }
    }

    fn drop_parsers(&self, conn_id: &str) {
        let mut parsers = self.parsers.lock().expect("parser map poisoned");
        for direction in [Direction::Request, Direction::Response] {
            parsers.remove(&format!("{}|{}", conn_id, direction.as_str()));
        }
    }

    /// Audit the WebSocket upgrade exchange as one request/response pair.
    fn audit_handshake_pair(&self, conn_id: &str, request: &[u8], response: &[u8]) {
        let Some(auditor) = &self.auditor else {
            return;
        };
        if !self.settings.audit_enabled {
            return;
        }
        let now = Utc::now();
        auditor.enqueue(AuditEvent {
            ctx: self.audit_ctx.clone(),
            conn_id: conn_id.to_string(),
            message: HttpMessage {
                kind: HttpMessageKind::Request,
                bytes: request.to_vec(),
                timestamp: now,
            },
        });
        auditor.enqueue(AuditEvent {
            ctx: self.audit_ctx.clone(),
            conn_id: conn_id.to_string(),
            message: HttpMessage {
                kind: HttpMessageKind::Response,
                bytes: response.to_vec(),
                timestamp: Utc::now(),
            },
        });
    }
}

/// `"<client_ip:port>-><upstream_host:port>"`, the audit grouping key.
fn conn_id(peer: SocketAddr, host: &str, port: u16) -> String {
    format!("{}->{}:{}", peer, host, port)
}

struct ConnGuard {
    session: Arc<Session>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.session.active_conns.fetch_sub(1, Ordering::Relaxed);
    }
}

fn report_handler_exit(mapping_id: &str, result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            log::error!("Session '{}' handler task panicked: {}", mapping_id, e);
        }
    }
}
