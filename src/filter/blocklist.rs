use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::borrow::Cow;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read blocklist {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Diagnostics for the currently active host set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlocklistStats {
    pub source: Option<PathBuf>,
    /// Entries parsed from the source, duplicates included
    pub raw_entries: usize,
    pub distinct_entries: usize,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug)]
struct HostSet {
    hosts: FxHashSet<Box<str>>,
    stats: BlocklistStats,
}

impl HostSet {
    fn build(entries: Vec<Box<str>>, source: Option<PathBuf>) -> Self {
        let raw_entries = entries.len();
        let hosts: FxHashSet<Box<str>> = entries.into_iter().collect();
        let stats = BlocklistStats {
            source,
            raw_entries,
            distinct_entries: hosts.len(),
            loaded_at: Utc::now(),
        };
        Self { hosts, stats }
    }
}

/// Host blocklist with lock-free lookups and atomic reloads.
///
/// Readers call [`BlocklistIndex::matches`] on the hot path; a reload builds
/// the replacement set off to the side and publishes it with a single
/// pointer swap, so a lookup sees either the old set or the new one.
#[derive(Debug)]
pub struct BlocklistIndex {
    current: ArcSwap<HostSet>,
}

impl Default for BlocklistIndex {
    fn default() -> Self {
        Self::empty()
    }
}

impl BlocklistIndex {
    pub fn empty() -> Self {
        Self::from_entries(Vec::new(), None)
    }

    /// Load a hosts-file formatted blocklist. A missing file yields an
    /// empty index.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let set = read_host_set(path.as_ref())?;
        Ok(Self {
            current: ArcSwap::from_pointee(set),
        })
    }

    pub fn from_text(text: &str) -> Self {
        Self::from_entries(Self::parse(text), None)
    }

    fn from_entries(entries: Vec<Box<str>>, source: Option<PathBuf>) -> Self {
        Self {
            current: ArcSwap::from_pointee(HostSet::build(entries, source)),
        }
    }

    /// Extract host patterns in source order.
    ///
    /// Blank lines and `#` comments are skipped; the last whitespace
    /// separated token of every other line is the host, so both
    /// `0.0.0.0 ads.example.com` and a bare `ads.example.com` work.
    pub fn parse(text: &str) -> Vec<Box<str>> {
        text.lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    return None;
                }
                line.split_whitespace()
                    .last()
                    .map(|host| normalize_host(host).into_owned().into_boxed_str())
            })
            .collect()
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.current.load().hosts.contains(host.as_ref())
    }

    /// Replace the active set with a fresh load of `path`.
    ///
    /// On failure the previous set stays active.
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<BlocklistStats, LoadError> {
        let path = path.as_ref();
        let set = match read_host_set(path) {
            Ok(set) => set,
            Err(err) => {
                tracing::warn!("Blocklist reload failed, keeping previous entries: {err}");
                return Err(err);
            }
        };
        let stats = set.stats.clone();
        self.current.store(Arc::new(set));
        tracing::info!(
            "Blocklist reloaded from {}: {} distinct hosts ({} raw entries)",
            path.display(),
            stats.distinct_entries,
            stats.raw_entries
        );
        Ok(stats)
    }

    pub fn len(&self) -> usize {
        self.current.load().hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BlocklistStats {
        self.current.load().stats.clone()
    }
}

fn read_host_set(path: &Path) -> Result<HostSet, LoadError> {
    let entries = match std::fs::read_to_string(path) {
        Ok(text) => BlocklistIndex::parse(&text),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tracing::info!(
                "No blocklist at {}, starting with an empty list",
                path.display()
            );
            Vec::new()
        }
        Err(source) => {
            return Err(LoadError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    Ok(HostSet::build(entries, Some(path.to_path_buf())))
}

/// Lowercase a host and drop a single trailing root dot.
pub fn normalize_host(host: &str) -> Cow<'_, str> {
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(host.to_ascii_lowercase())
    } else {
        Cow::Borrowed(host)
    }
}
