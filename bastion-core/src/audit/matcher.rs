//! FIFO request/response pairing.
//!
//! Requests queue per connection id; each response pops the head of its
//! connection's queue, which matches HTTP/1.1 pipelining order. Requests
//! that never see a response are reaped periodically and logged with no
//! response half.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use super::parser::HttpMessage;
use super::store::{build_log, HttpLogStore};
use super::AuditContext;

struct PendingRequest {
    ctx: AuditContext,
    message: HttpMessage,
}

pub struct PairMatcher {
    store: Arc<HttpLogStore>,
    max_age: Duration,
    pending: Mutex<HashMap<String, VecDeque<PendingRequest>>>,
}

impl PairMatcher {
    pub fn new(store: Arc<HttpLogStore>, max_age: Duration) -> Self {
        PairMatcher {
            store,
            max_age,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn on_request(&self, conn_id: &str, ctx: AuditContext, message: HttpMessage) {
        let mut pending = self.pending.lock().expect("matcher lock poisoned");
        pending
            .entry(conn_id.to_string())
            .or_default()
            .push_back(PendingRequest { ctx, message });
    }

    /// Pair a response with the oldest pending request on its connection.
    /// Responses with no pending request are dropped.
    pub fn on_response(&self, conn_id: &str, message: HttpMessage) {
        let popped = {
            let mut pending = self.pending.lock().expect("matcher lock poisoned");
            match pending.get_mut(conn_id) {
                Some(q) => {
                    let head = q.pop_front();
                    if q.is_empty() {
                        pending.remove(conn_id);
                    }
                    head
                }
                None => None,
            }
        };

        match popped {
            Some(req) => {
                let log = build_log(&req.ctx, conn_id, &req.message, Some(&message));
                self.store.insert(log);
            }
            None => {
                log::debug!("Dropping unmatched response on {}", conn_id);
            }
        }
    }

    /// Log-and-remove every request older than the max age. Reaped pairs
    /// carry status 0 and zero duration.
    pub fn reap_stale(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::zero());

        let stale: Vec<(String, PendingRequest)> = {
            let mut pending = self.pending.lock().expect("matcher lock poisoned");
            let mut stale = Vec::new();
            for (conn_id, queue) in pending.iter_mut() {
                while queue
                    .front()
                    .map(|r| r.message.timestamp <= cutoff)
                    .unwrap_or(false)
                {
                    let req = queue.pop_front().expect("checked front");
                    stale.push((conn_id.clone(), req));
                }
            }
            pending.retain(|_, q| !q.is_empty());
            stale
        };

        if !stale.is_empty() {
            log::info!("Reaping {} unanswered audited requests", stale.len());
        }
        for (conn_id, req) in stale {
            let log = build_log(&req.ctx, &conn_id, &req.message, None);
            self.store.insert(log);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .expect("matcher lock poisoned")
            .values()
            .map(|q| q.len())
            .sum()
    }
}
