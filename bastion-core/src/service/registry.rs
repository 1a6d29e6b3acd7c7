//! Process-wide registry of running sessions.
//!
//! The mapping orchestrator starts and stops sessions through this map.
//! Removal happens under the write lock but the session itself is stopped
//! after the lock is released, so a slow shutdown can never wedge other
//! registry users.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::app::session::{Session, SessionStats};
use crate::error::{CoreError, Result};

lazy_static::lazy_static! {
    static ref SESSIONS: RwLock<HashMap<String, Arc<Session>>> = RwLock::new(HashMap::new());
}

/// Register a freshly started session. Fails when the mapping already
/// has one.
pub async fn add(session: Arc<Session>) -> Result<()> {
    let mut sessions = SESSIONS.write().await;
    let id = session.mapping_id().to_string();
    if sessions.contains_key(&id) {
        return Err(CoreError::conflict(format!(
            "mapping '{}' is already running",
            id
        )));
    }
    sessions.insert(id, session);
    Ok(())
}

pub async fn get(mapping_id: &str) -> Option<Arc<Session>> {
    SESSIONS.read().await.get(mapping_id).cloned()
}

pub async fn exists(mapping_id: &str) -> bool {
    SESSIONS.read().await.contains_key(mapping_id)
}

/// Remove under the lock, stop outside it.
pub async fn remove_and_stop(mapping_id: &str) -> Result<()> {
    let session = {
        let mut sessions = SESSIONS.write().await;
        sessions.remove(mapping_id)
    };
    match session {
        Some(session) => {
            session.stop().await;
            Ok(())
        }
        None => Err(CoreError::NotFound(format!(
            "mapping '{}' is not running",
            mapping_id
        ))),
    }
}

/// Per-mapping stats snapshot for the health surface.
pub async fn stats_all() -> HashMap<String, SessionStats> {
    let sessions = SESSIONS.read().await;
    sessions
        .iter()
        .map(|(id, s)| (id.clone(), s.stats()))
        .collect()
}

pub async fn running_count() -> usize {
    SESSIONS.read().await.len()
}

/// Stop every session. Used at process shutdown.
pub async fn stop_all() {
    let sessions: Vec<Arc<Session>> = {
        let mut map = SESSIONS.write().await;
        map.drain().map(|(_, s)| s).collect()
    };
    for session in sessions {
        session.stop().await;
    }
}
