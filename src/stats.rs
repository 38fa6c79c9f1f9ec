//! Lock-free counters for the admin status view

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct ProxyStats {
    total_requests: AtomicU64,
    blocked_requests: AtomicU64,
    completed_requests: AtomicU64,
    failed_requests: AtomicU64,
    history_failures: AtomicU64,
    last_history_error: RwLock<Option<String>>,
}

/// Point-in-time copy of [`ProxyStats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub history_failures: u64,
    pub last_history_error: Option<String>,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.blocked_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_history_failure(&self, message: String) {
        self.history_failures.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.last_history_error.write() {
            *guard = Some(message);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            blocked_requests: self.blocked_requests.load(Ordering::Relaxed),
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            history_failures: self.history_failures.load(Ordering::Relaxed),
            last_history_error: self
                .last_history_error
                .read()
                .ok()
                .and_then(|guard| guard.clone()),
        }
    }
}
