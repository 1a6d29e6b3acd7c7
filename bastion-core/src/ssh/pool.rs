//! Keyed pool of SSH chain clients.
//!
//! Entries are interned under the chain key and tracked with an active
//! tunnel count. An entry with live tunnels is never evicted, never idle
//! closed and never removed on a failed probe. The pool mutex is only
//! held around map bookkeeping; every network operation runs on cloned
//! handles after the lock is released.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, Result};
use crate::store::Bastion;

use super::chain::{BoxedStream, ChainConnector, ChainTransport};
use super::chain_key;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_conns: usize,
    pub idle_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_conns: 64,
            idle_timeout: Duration::from_secs(900),
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_millis(500),
        }
    }
}

struct PoolEntry {
    client: Arc<dyn ChainTransport>,
    created_at: Instant,
    last_used_at: Instant,
    last_keepalive_at: Instant,
    active_conns: Arc<AtomicI64>,
}

impl PoolEntry {
    fn new(client: Arc<dyn ChainTransport>) -> Self {
        let now = Instant::now();
        PoolEntry {
            client,
            created_at: now,
            last_used_at: now,
            last_keepalive_at: now,
            active_conns: Arc::new(AtomicI64::new(0)),
        }
    }

    fn active(&self) -> i64 {
        self.active_conns.load(Ordering::Relaxed)
    }
}

/// Decrements the owning entry's active count exactly once.
struct ActiveGuard {
    counter: Arc<AtomicI64>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A tunneled upstream connection. Dropping it releases the pooled chain
/// client for reuse.
pub struct TunnelStream {
    inner: BoxedStream,
    _guard: ActiveGuard,
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream").finish_non_exhaustive()
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
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

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolMetrics {
    pub pool_size: usize,
    pub active_conns_total: i64,
    pub keepalive_failures_total: u64,
    pub idle_closed_total: u64,
}

pub struct SshPool {
    cfg: PoolConfig,
    connector: Box<dyn ChainConnector>,
    entries: Mutex<HashMap<String, PoolEntry>>,
    keepalive_failures: AtomicU64,
    idle_closed: AtomicU64,
    shutdown: CancellationToken,
}

impl SshPool {
    pub fn new(cfg: PoolConfig, connector: Box<dyn ChainConnector>) -> Arc<Self> {
        Arc::new(SshPool {
            cfg,
            connector,
            entries: Mutex::new(HashMap::new()),
            keepalive_failures: AtomicU64::new(0),
            idle_closed: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the periodic idle-close + keepalive task.
    pub fn start_housekeeping(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pool.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(HOUSEKEEPING_INTERVAL) => {
                        pool.housekeeping_once().await;
                    }
                }
            }
            log::debug!("SSH pool housekeeping stopped");
        });
    }

    /// Obtain (or build) the chain client for `bastions` and open a tunnel
    /// to `addr` through it. The returned stream releases the entry's
    /// active slot when dropped.
    pub async fn dial(&self, bastions: &[Bastion], host: &str, port: u16) -> Result<TunnelStream> {
        let key = chain_key(bastions);
        let (client, counter) = self.get_or_create(&key, bastions).await?;

        counter.fetch_add(1, Ordering::Relaxed);
        let guard = ActiveGuard {
            counter: Arc::clone(&counter),
        };

        match client.open_tunnel(host, port).await {
            Ok(inner) => Ok(TunnelStream {
                inner,
                _guard: guard,
            }),
            Err(e) => {
                // guard drop returns the slot
                log::debug!("Tunnel open to {}:{} via '{}' failed: {}", host, port, key, e);
                Err(e)
            }
        }
    }

    async fn get_or_create(
        &self,
        key: &str,
        bastions: &[Bastion],
    ) -> Result<(Arc<dyn ChainTransport>, Arc<AtomicI64>)> {
        let mut evicted: Vec<Arc<dyn ChainTransport>> = Vec::new();

        // fast path, and capacity eviction for the slow path
        {
            let mut entries = self.entries.lock().expect("pool lock poisoned");
            if let Some(entry) = entries.get_mut(key) {
                entry.last_used_at = Instant::now();
                return Ok((Arc::clone(&entry.client), Arc::clone(&entry.active_conns)));
            }

            while entries.len() >= self.cfg.max_conns {
                let victim = entries
                    .iter()
                    .filter(|(_, e)| e.active() == 0)
                    .min_by_key(|(_, e)| e.last_used_at)
                    .map(|(k, _)| k.clone());
                match victim {
                    Some(k) => {
                        if let Some(entry) = entries.remove(&k) {
                            log::info!("SSH pool evicting idle chain '{}'", k);
                            evicted.push(entry.client);
                        }
                    }
                    None => {
                        return Err(CoreError::ResourceBusy(format!(
                            "ssh pool at capacity ({}) with all chains in use",
                            self.cfg.max_conns
                        )));
                    }
                }
            }
        }

        for client in evicted {
            client.close().await;
        }

        // chain construction happens with no lock held
        let client: Arc<dyn ChainTransport> = Arc::from(self.connector.connect(bastions).await?);

        // Ok(counter) => we inserted our own chain; Err(adopted) => someone else won the race.
        let outcome = {
            let mut entries = self.entries.lock().expect("pool lock poisoned");
            if let Some(existing) = entries.get_mut(key) {
                // lost the race; adopt the winner and close ours later
                existing.last_used_at = Instant::now();
                Err((
                    Arc::clone(&existing.client),
                    Arc::clone(&existing.active_conns),
                ))
            } else {
                let entry = PoolEntry::new(Arc::clone(&client));
                let counter = Arc::clone(&entry.active_conns);
                entries.insert(key.to_string(), entry);
                Ok(counter)
            }
        };
        match outcome {
            Ok(counter) => Ok((client, counter)),
            Err(adopted) => {
                client.close().await;
                Ok(adopted)
            }
        }
    }

    /// One idle-close + keepalive sweep. Public so tests and the
    /// housekeeping task share the same code path.
    pub async fn housekeeping_once(&self) {
        let now = Instant::now();
        let mut closers: Vec<Arc<dyn ChainTransport>> = Vec::new();
        let mut probes: Vec<(String, Arc<dyn ChainTransport>)> = Vec::new();

        {
            let mut entries = self.entries.lock().expect("pool lock poisoned");

            let idle_keys: Vec<String> = entries
                .iter()
                .filter(|(_, e)| {
                    e.active() == 0 && now.duration_since(e.last_used_at) >= self.cfg.idle_timeout
                })
                .map(|(k, _)| k.clone())
                .collect();
            for key in idle_keys {
                if let Some(entry) = entries.remove(&key) {
                    log::info!(
                        "SSH pool closing idle chain '{}' (age {:?})",
                        key,
                        now.duration_since(entry.created_at)
                    );
                    self.idle_closed.fetch_add(1, Ordering::Relaxed);
                    closers.push(entry.client);
                }
            }

            for (key, entry) in entries.iter() {
                if now.duration_since(entry.last_keepalive_at) >= self.cfg.keepalive_interval {
                    probes.push((key.clone(), Arc::clone(&entry.client)));
                }
            }
        }

        for client in closers {
            client.close().await;
        }

        for (key, client) in probes {
            let outcome = client.probe(self.cfg.keepalive_timeout).await;
            let dead = {
                let mut entries = self.entries.lock().expect("pool lock poisoned");
                let Some(entry) = entries.get_mut(&key) else {
                    continue;
                };
                match outcome {
                    Ok(()) => {
                        entry.last_keepalive_at = Instant::now();
                        None
                    }
                    Err(e) => {
                        self.keepalive_failures.fetch_add(1, Ordering::Relaxed);
                        if entry.active() == 0 {
                            log::warn!("SSH chain '{}' failed keepalive, closing: {}", key, e);
                            entries.remove(&key).map(|e| e.client)
                        } else {
                            // live tunnels: back off instead of thrashing the chain
                            log::warn!(
                                "SSH chain '{}' failed keepalive with {} active conns, throttling",
                                key,
                                entry.active()
                            );
                            entry.last_keepalive_at = Instant::now();
                            None
                        }
                    }
                }
            };
            if let Some(dead) = dead {
                dead.close().await;
            }
        }
    }

    /// Drop a chain by its key and close it outside the lock.
    pub async fn remove(&self, key: &str) {
        let client = {
            let mut entries = self.entries.lock().expect("pool lock poisoned");
            entries.remove(key).map(|e| e.client)
        };
        if let Some(client) = client {
            client.close().await;
        }
    }

    /// Tear down every pooled chain. Used at process shutdown.
    pub async fn close_all(&self) {
        self.shutdown.cancel();
        let clients: Vec<Arc<dyn ChainTransport>> = {
            let mut entries = self.entries.lock().expect("pool lock poisoned");
            entries.drain().map(|(_, e)| e.client).collect()
        };
        for client in clients {
            client.close().await;
        }
    }

    pub fn metrics(&self) -> PoolMetrics {
        let entries = self.entries.lock().expect("pool lock poisoned");
        PoolMetrics {
            pool_size: entries.len(),
            active_conns_total: entries.values().map(|e| e.active()).sum(),
            keepalive_failures_total: self.keepalive_failures.load(Ordering::Relaxed),
            idle_closed_total: self.idle_closed.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn seed_entry(&self, key: &str, client: Arc<dyn ChainTransport>, last_keepalive: Instant) {
        let mut entry = PoolEntry::new(client);
        entry.last_keepalive_at = last_keepalive;
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FakeChain {
        probe_fails: bool,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChainTransport for FakeChain {
        async fn open_tunnel(&self, _host: &str, _port: u16) -> Result<BoxedStream> {
            let (local, _remote) = tokio::io::duplex(64);
            Ok(Box::new(local))
        }

        async fn probe(&self, _timeout: Duration) -> Result<()> {
            if self.probe_fails {
                Err(CoreError::Timeout("probe".to_string()))
            } else {
                Ok(())
            }
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct FakeConnector {
        probe_fails: bool,
        built: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChainConnector for FakeConnector {
        async fn connect(&self, _bastions: &[Bastion]) -> Result<Box<dyn ChainTransport>> {
            self.built.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(FakeChain {
                probe_fails: self.probe_fails,
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    fn bastion(name: &str) -> Bastion {
        Bastion {
            name: name.to_string(),
            host: "10.0.0.1".to_string(),
            port: 22,
            username: "ops".to_string(),
            auth: crate::store::BastionAuth {
                password: Some("pw".to_string()),
                ..Default::default()
            },
        }
    }

    fn pool_with(cfg: PoolConfig, probe_fails: bool) -> (Arc<SshPool>, Arc<AtomicUsize>) {
        let built = Arc::new(AtomicUsize::new(0));
        let pool = SshPool::new(
            cfg,
            Box::new(FakeConnector {
                probe_fails,
                built: Arc::clone(&built),
                closed: Arc::new(AtomicUsize::new(0)),
            }),
        );
        (pool, built)
    }

    #[tokio::test]
    async fn dial_reuses_pooled_chain() {
        let (pool, built) = pool_with(PoolConfig::default(), false);
        let chain = vec![bastion("a")];
        let s1 = pool.dial(&chain, "t", 80).await.unwrap();
        let s2 = pool.dial(&chain, "t", 81).await.unwrap();
        assert_eq!(built.load(Ordering::Relaxed), 1);
        assert_eq!(pool.metrics().active_conns_total, 2);
        drop(s1);
        drop(s2);
        assert_eq!(pool.metrics().active_conns_total, 0);
        assert_eq!(pool.metrics().pool_size, 1);
    }

    #[tokio::test]
    async fn capacity_with_all_active_fails_busy() {
        let cfg = PoolConfig {
            max_conns: 1,
            ..Default::default()
        };
        let (pool, _) = pool_with(cfg, false);
        let _held = pool.dial(&[bastion("a")], "t", 80).await.unwrap();
        let err = pool.dial(&[bastion("b")], "t", 80).await.unwrap_err();
        assert!(matches!(err, CoreError::ResourceBusy(_)));
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_idle_entry() {
        let cfg = PoolConfig {
            max_conns: 1,
            ..Default::default()
        };
        let (pool, built) = pool_with(cfg, false);
        let s = pool.dial(&[bastion("a")], "t", 80).await.unwrap();
        drop(s); // chain 'a' now idle
        let _s2 = pool.dial(&[bastion("b")], "t", 80).await.unwrap();
        assert_eq!(built.load(Ordering::Relaxed), 2);
        let metrics = pool.metrics();
        assert_eq!(metrics.pool_size, 1);
    }

    #[tokio::test]
    async fn keepalive_failure_removes_idle_entry() {
        let cfg = PoolConfig {
            idle_timeout: Duration::from_secs(3600),
            keepalive_interval: Duration::from_secs(1),
            ..Default::default()
        };
        let (pool, _) = pool_with(cfg, true);
        let closed = Arc::new(AtomicUsize::new(0));
        pool.seed_entry(
            "edge",
            Arc::new(FakeChain {
                probe_fails: true,
                closed: Arc::clone(&closed),
            }),
            Instant::now() - Duration::from_secs(60),
        );

        pool.housekeeping_once().await;

        let metrics = pool.metrics();
        assert_eq!(metrics.pool_size, 0);
        assert_eq!(metrics.keepalive_failures_total, 1);
        assert_eq!(closed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn keepalive_failure_throttles_active_entry() {
        let cfg = PoolConfig {
            keepalive_interval: Duration::from_secs(1),
            ..Default::default()
        };
        let (pool, _) = pool_with(cfg, true);
        let chain = vec![bastion("a")];
        let _held = pool.dial(&chain, "t", 80).await.unwrap();

        // age the probe timestamp past the interval
        {
            let mut entries = pool.entries.lock().unwrap();
            let entry = entries.get_mut("a").unwrap();
            entry.last_keepalive_at = Instant::now() - Duration::from_secs(60);
        }

        pool.housekeeping_once().await;

        let metrics = pool.metrics();
        assert_eq!(metrics.pool_size, 1);
        assert_eq!(metrics.keepalive_failures_total, 1);
        assert_eq!(metrics.active_conns_total, 1);
    }

    #[tokio::test]
    async fn idle_timeout_closes_unused_chain() {
        let cfg = PoolConfig {
            idle_timeout: Duration::ZERO,
            keepalive_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let (pool, _) = pool_with(cfg, false);
        let s = pool.dial(&[bastion("a")], "t", 80).await.unwrap();
        drop(s);
        pool.housekeeping_once().await;
        let metrics = pool.metrics();
        assert_eq!(metrics.pool_size, 0);
        assert_eq!(metrics.idle_closed_total, 1);
    }
}
