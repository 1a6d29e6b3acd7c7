//! Streaming HTTP audit pipeline.
//!
//! Copiers on the forwarding path feed parsed HTTP messages into a
//! bounded queue; a single consumer pairs them into request/response logs
//! and lands them in the bounded store. The queue drops on full so the
//! forwarding path is never blocked by auditing.

pub mod gzip;
pub mod matcher;
pub mod parser;
pub mod store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use matcher::PairMatcher;
use parser::{HttpMessage, HttpMessageKind};
use store::{HttpLogStore, StoreConfig};

/// Attached to every audited message so logs can be filtered per mapping
/// and per bastion.
#[derive(Debug, Clone, Serialize)]
pub struct AuditContext {
    pub mapping_id: String,
    pub local_port: u16,
    pub bastion_chain: Vec<String>,
}

#[derive(Debug)]
pub struct AuditEvent {
    pub ctx: AuditContext,
    pub conn_id: String,
    pub message: HttpMessage,
}

#[derive(Debug, Clone)]
pub struct AuditorConfig {
    pub queue_size: usize,
    pub pair_cleanup_interval: Duration,
    pub pair_max_age: Duration,
    pub store: StoreConfig,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        AuditorConfig {
            queue_size: 1000,
            pair_cleanup_interval: Duration::from_secs(300),
            pair_max_age: Duration::from_secs(600),
            store: StoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditMetrics {
    pub stored: usize,
    pub total_seen: u64,
    pub dropped_total: u64,
    pub pending_pairs: usize,
    pub queue_capacity: usize,
}

pub struct Auditor {
    tx: mpsc::Sender<AuditEvent>,
    store: Arc<HttpLogStore>,
    matcher: Arc<PairMatcher>,
    dropped: AtomicU64,
    queue_size: usize,
    shutdown: CancellationToken,
}

impl Auditor {
    /// Build the pipeline and spawn its consumer and reaper tasks.
    pub fn start(cfg: AuditorConfig) -> Arc<Auditor> {
        let store = Arc::new(HttpLogStore::new(cfg.store.clone()));
        let matcher = Arc::new(PairMatcher::new(Arc::clone(&store), cfg.pair_max_age));
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(cfg.queue_size);
        let shutdown = CancellationToken::new();

        let auditor = Arc::new(Auditor {
            tx,
            store,
            matcher: Arc::clone(&matcher),
            dropped: AtomicU64::new(0),
            queue_size: cfg.queue_size,
            shutdown: shutdown.clone(),
        });

        // single consumer feeds the matcher
        {
            let matcher = Arc::clone(&matcher);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = rx.recv() => match event {
                            Some(event) => dispatch(&matcher, event),
                            None => break,
                        },
                        _ = shutdown.cancelled() => {
                            // drain whatever is already queued, then exit
                            while let Ok(event) = rx.try_recv() {
                                dispatch(&matcher, event);
                            }
                            break;
                        }
                    }
                }
                log::debug!("Audit consumer stopped");
            });
        }

        // stale pair reaper
        {
            let matcher = Arc::clone(&matcher);
            let shutdown = shutdown.clone();
            let interval = cfg.pair_cleanup_interval;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(interval) => matcher.reap_stale(),
                    }
                }
                log::debug!("Audit pair reaper stopped");
            });
        }

        auditor
    }

    /// Non-blocking enqueue. A full queue drops the event and bumps the
    /// counter; forwarding always wins over auditing.
    pub fn enqueue(&self, event: AuditEvent) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if let Err(e) = self.tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("Audit queue full, dropping message: {}", e);
        }
    }

    pub fn store(&self) -> &Arc<HttpLogStore> {
        &self.store
    }

    pub fn metrics(&self) -> AuditMetrics {
        let store = self.store.metrics();
        AuditMetrics {
            stored: store.stored,
            total_seen: store.total_seen,
            dropped_total: self.dropped.load(Ordering::Relaxed),
            pending_pairs: self.matcher.pending_len(),
            queue_capacity: self.queue_size,
        }
    }

    /// Idempotent: the consumer drains and exits, further enqueues no-op.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

fn dispatch(matcher: &PairMatcher, event: AuditEvent) {
    match event.message.kind {
        HttpMessageKind::Request => {
            matcher.on_request(&event.conn_id, event.ctx, event.message);
        }
        HttpMessageKind::Response => {
            matcher.on_response(&event.conn_id, event.message);
        }
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL: RwLock<Option<Arc<Auditor>>> = RwLock::new(None);
}

/// Install the process-wide auditor. Replaces (and stops) any previous one.
pub fn install(auditor: Arc<Auditor>) {
    let previous = {
        let mut global = GLOBAL.write().expect("auditor cell poisoned");
        global.replace(auditor)
    };
    if let Some(previous) = previous {
        previous.stop();
    }
}

pub fn global() -> Option<Arc<Auditor>> {
    GLOBAL.read().expect("auditor cell poisoned").clone()
}

/// Stop and remove the process-wide auditor.
pub fn teardown() {
    let previous = {
        let mut global = GLOBAL.write().expect("auditor cell poisoned");
        global.take()
    };
    if let Some(previous) = previous {
        previous.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(kind: HttpMessageKind, conn: &str) -> AuditEvent {
        let bytes = match kind {
            HttpMessageKind::Request => b"GET / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec(),
            HttpMessageKind::Response => {
                b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()
            }
        };
        AuditEvent {
            ctx: AuditContext {
                mapping_id: "m".to_string(),
                local_port: 1,
                bastion_chain: vec![],
            },
            conn_id: conn.to_string(),
            message: HttpMessage {
                kind,
                bytes,
                timestamp: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn consumer_pairs_request_and_response() {
        let auditor = Auditor::start(AuditorConfig::default());
        auditor.enqueue(event(HttpMessageKind::Request, "c1"));
        auditor.enqueue(event(HttpMessageKind::Response, "c1"));

        // consumer runs on the runtime; give it a beat
        for _ in 0..50 {
            if auditor.metrics().stored == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(auditor.metrics().stored, 1);
        auditor.stop();
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        // tiny queue with a consumer that cannot keep up: stop first so
        // the consumer exits, then enqueue into the dead channel
        let auditor = Auditor::start(AuditorConfig {
            queue_size: 1,
            ..Default::default()
        });
        // fill the single slot plus one overflow without yielding
        auditor.enqueue(event(HttpMessageKind::Request, "c1"));
        auditor.enqueue(event(HttpMessageKind::Request, "c2"));
        auditor.enqueue(event(HttpMessageKind::Request, "c3"));
        // at least one of the three must have been dropped synchronously
        assert!(auditor.metrics().dropped_total >= 1);
        auditor.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_blocks_enqueue() {
        let auditor = Auditor::start(AuditorConfig::default());
        auditor.stop();
        auditor.stop();
        auditor.enqueue(event(HttpMessageKind::Request, "c1"));
        assert_eq!(auditor.metrics().dropped_total, 0);
    }
}
