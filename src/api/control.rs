//! Administrative interface
//!
//! [`ProxyControl`] is the one place shared proxy state is changed from the
//! outside: the blocking toggle, private mode and the blocklist contents.

use crate::filter::{BlocklistStats, LoadError, RequestInterceptor};
use crate::models::VisitRecord;
use crate::stats::{ProxyStats, StatsSnapshot};
use crate::storage::HistoryStore;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Snapshot returned by [`ProxyControl::status`]
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub version: &'static str,
    pub blocking_active: bool,
    pub private_mode: bool,
    pub history_entries: usize,
    pub blocklist: BlocklistStats,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone)]
pub struct ProxyControl {
    interceptor: Arc<RequestInterceptor>,
    history: Arc<HistoryStore>,
    stats: Arc<ProxyStats>,
    blocklist_path: PathBuf,
}

impl ProxyControl {
    pub fn new(
        interceptor: Arc<RequestInterceptor>,
        history: Arc<HistoryStore>,
        stats: Arc<ProxyStats>,
        blocklist_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            interceptor,
            history,
            stats,
            blocklist_path: blocklist_path.into(),
        }
    }

    /// Takes effect for requests evaluated after this returns.
    pub fn set_blocking_active(&self, active: bool) {
        self.interceptor.set_active(active);
        tracing::info!("Blocking {}", if active { "enabled" } else { "disabled" });
    }

    /// Takes effect for visits completed after this returns.
    pub fn set_private_mode(&self, enabled: bool) {
        self.history.set_private_mode(enabled);
        tracing::info!(
            "Private mode {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn get_history(&self) -> Vec<VisitRecord> {
        self.history.load_all()
    }

    /// Re-read the configured blocklist file. On error the previous entries
    /// stay active.
    pub async fn reload_blocklist(&self) -> Result<BlocklistStats, LoadError> {
        let blocklist = Arc::clone(self.interceptor.blocklist());
        let path = self.blocklist_path.clone();
        tokio::task::spawn_blocking(move || blocklist.reload(&path))
            .await
            .map_err(|e| LoadError::Read {
                path: self.blocklist_path.clone(),
                source: io::Error::other(e),
            })?
    }

    pub fn blocklist_path(&self) -> &Path {
        &self.blocklist_path
    }

    pub fn status(&self) -> ProxyStatus {
        ProxyStatus {
            version: crate::VERSION,
            blocking_active: self.interceptor.blocking_state().active,
            private_mode: self.history.is_private_mode(),
            history_entries: self.history.len(),
            blocklist: self.interceptor.blocklist().stats(),
            stats: self.stats.snapshot(),
        }
    }
}
