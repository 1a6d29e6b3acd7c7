//! Process bootstrap for the bastion forwarding core.
//!
//! Startup order matters: logging first, then settings, then the audit
//! pipeline and SSH pool, then every auto-start mapping. Shutdown walks
//! the same list in reverse so listeners and SSH chains are released
//! before the process exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bastion_core::audit::{self, Auditor, AuditorConfig};
use bastion_core::audit::store::StoreConfig;
use bastion_core::config::{self, Settings};
use bastion_core::service::registry;
use bastion_core::ssh::chain::{ChainConfig, RusshConnector};
use bastion_core::ssh::pool::{PoolConfig, SshPool};
use bastion_core::store::{ConfigStore, MemoryStore};
use bastion_core::{app, writer};

#[tokio::main]
async fn main() {
    config::init();
    let settings = Settings::current();
    writer::writer_start(&settings);

    eprintln!("[----] Starting bastion core...");

    // Audit pipeline
    let auditor = Auditor::start(AuditorConfig {
        queue_size: settings.audit_queue_size,
        pair_cleanup_interval: Duration::from_secs(
            settings.http_pair_cleanup_interval_minutes * 60,
        ),
        pair_max_age: Duration::from_secs(settings.http_pair_max_age_minutes * 60),
        store: StoreConfig {
            max_logs: settings.max_http_logs,
            gzip_max_bytes: settings.http_gzip_decode_max_bytes,
            gzip_timeout: Duration::from_millis(settings.http_gzip_decode_timeout_ms),
            cache_ttl: Duration::from_secs(settings.http_gzip_decode_cache_seconds),
        },
    });
    audit::install(auditor);

    // SSH chain pool
    let pool = SshPool::new(
        PoolConfig {
            max_conns: settings.ssh_pool_max_conns,
            idle_timeout: Duration::from_secs(settings.ssh_pool_idle_timeout_seconds),
            keepalive_interval: Duration::from_secs(settings.ssh_pool_keepalive_interval_seconds),
            keepalive_timeout: Duration::from_millis(settings.ssh_pool_keepalive_timeout_ms),
        },
        Box::new(RusshConnector::new(ChainConfig {
            connect_timeout: Duration::from_secs(settings.ssh_connect_timeout_seconds),
            max_retries: settings.ssh_connect_max_retries,
            retry_delay: Duration::from_secs(settings.ssh_connect_retry_delay_seconds),
            keepalive_interval: Duration::from_secs(settings.ssh_keepalive_interval_seconds),
        })),
    );
    pool.start_housekeeping();

    // Record store; the management plane owns the document
    let store: Arc<dyn ConfigStore> = Arc::new(load_store());

    // Launch every auto-start mapping
    match store.list_mappings().await {
        Ok(mappings) => {
            for mapping in mappings.into_iter().filter(|m| m.auto_start) {
                match app::session::start(&store, Arc::clone(&pool), &mapping.id).await {
                    Ok(_) => log::info!("Auto-started mapping '{}'", mapping.id),
                    Err(e) => log::error!("Failed to auto-start mapping '{}': {}", mapping.id, e),
                }
            }
        }
        Err(e) => log::error!("Failed to enumerate mappings: {}", e),
    }

    eprintln!("[----] Starting CTRL+C listener...");
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            eprintln!("\n[----] SIGINT received, shutting down...");
            running.store(false, Ordering::SeqCst);
        })
        .expect("Error setting Ctrl-C handler");
    }

    eprintln!("[----] Running.");
    let monitor_interval = Duration::from_secs(settings.task_monitor_interval_seconds.max(1));
    let mut last_monitor = tokio::time::Instant::now();

    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(500)).await;

        if last_monitor.elapsed() >= monitor_interval {
            last_monitor = tokio::time::Instant::now();
            let sessions = registry::running_count().await;
            let pool_metrics = pool.metrics();
            let audit_metrics = audit::global().map(|a| a.metrics());
            log::info!(
                "monitor: sessions={} ssh_pool={} ssh_active={} audit_stored={} audit_dropped={}",
                sessions,
                pool_metrics.pool_size,
                pool_metrics.active_conns_total,
                audit_metrics.as_ref().map(|m| m.stored).unwrap_or(0),
                audit_metrics.as_ref().map(|m| m.dropped_total).unwrap_or(0),
            );
        }
    }

    eprintln!("[----] Stopping sessions...");
    registry::stop_all().await;
    eprintln!("[----] Stopping audit pipeline...");
    audit::teardown();
    eprintln!("[----] Closing SSH chains...");
    pool.close_all().await;
    eprintln!("[----] Finish.\n");
}

/// Seed the in-memory store from `BASTION_STORE` when present.
fn load_store() -> MemoryStore {
    let Ok(path) = std::env::var("BASTION_STORE") else {
        log::warn!("BASTION_STORE not set; starting with an empty record store");
        return MemoryStore::new();
    };
    match std::fs::read_to_string(&path) {
        Ok(raw) => match MemoryStore::from_json(&raw) {
            Ok(store) => store,
            Err(e) => {
                log::error!("Failed to parse store document {}: {}", path, e);
                MemoryStore::new()
            }
        },
        Err(e) => {
            log::error!("Failed to read store document {}: {}", path, e);
            MemoryStore::new()
        }
    }
}
