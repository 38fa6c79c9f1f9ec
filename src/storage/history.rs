use crate::models::VisitRecord;
use anyhow::Context;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppendError {
    #[error("failed to write history entry: {0}")]
    Io(#[from] io::Error),
    #[error("history url must not contain whitespace: {0:?}")]
    InvalidUrl(String),
    #[error("history writer unavailable: {0}")]
    Unavailable(String),
}

/// Backing store for the history log.
pub trait DurableLog: Send {
    /// Append one newline-terminated line. Must not return `Ok` before the
    /// line has reached stable storage.
    fn append_line(&mut self, line: &str) -> io::Result<()>;
}

/// Append-only history file, `fdatasync`ed after every line.
#[derive(Debug)]
pub struct FileLog {
    file: File,
    path: PathBuf,
    committed_len: u64,
}

impl FileLog {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            committed_len,
        })
    }

    /// Open and cut the file back to `len` bytes, dropping a torn tail.
    fn open_truncated(path: &Path, len: u64) -> io::Result<Self> {
        let mut log = Self::open(path)?;
        if log.committed_len > len {
            log.file.set_len(len)?;
            log.committed_len = len;
        }
        Ok(log)
    }
}

impl DurableLog for FileLog {
    fn append_line(&mut self, line: &str) -> io::Result<()> {
        let result = self
            .file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.sync_data());
        match result {
            Ok(()) => {
                self.committed_len += line.len() as u64;
                Ok(())
            }
            Err(err) => {
                // A partial write would otherwise glue onto the next entry.
                if let Err(trunc_err) = self.file.set_len(self.committed_len) {
                    tracing::warn!(
                        "Could not roll back partial history write in {}: {}",
                        self.path.display(),
                        trunc_err
                    );
                }
                Err(err)
            }
        }
    }
}

/// Append-only visit log with an in-memory mirror.
///
/// The mirror only ever grows after the durable write succeeded, and both
/// happen under the writer lock, so the mirror is always a prefix of what is
/// on disk and in the same order.
pub struct HistoryStore {
    log: Arc<Mutex<Box<dyn DurableLog>>>,
    records: Arc<RwLock<Vec<VisitRecord>>>,
    private_mode: AtomicBool,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("len", &self.len())
            .field("private_mode", &self.is_private_mode())
            .finish()
    }
}

impl HistoryStore {
    /// Load the history file into memory and open it for appending. A
    /// missing file starts an empty history.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading history {}", path.display()))
            }
        };

        let complete_len = bytes
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|pos| pos + 1)
            .unwrap_or(0);
        if complete_len < bytes.len() {
            tracing::warn!(
                "Ignoring {} bytes of unterminated history entry in {}",
                bytes.len() - complete_len,
                path.display()
            );
        }

        let records: Vec<VisitRecord> = String::from_utf8_lossy(&bytes[..complete_len])
            .lines()
            .filter_map(VisitRecord::from_line)
            .collect();
        tracing::info!(
            "Loaded {} history entries from {}",
            records.len(),
            path.display()
        );

        let log = FileLog::open_truncated(path, complete_len as u64)
            .with_context(|| format!("opening history {} for append", path.display()))?;
        Ok(Self::with_log(records, Box::new(log)))
    }

    /// Build a store over an arbitrary durable log, seeded with `records`.
    pub fn with_log(records: Vec<VisitRecord>, log: Box<dyn DurableLog>) -> Self {
        Self {
            log: Arc::new(Mutex::new(log)),
            records: Arc::new(RwLock::new(records)),
            private_mode: AtomicBool::new(false),
        }
    }

    /// Record a visit. Returns `Ok` without writing while private mode is on.
    pub async fn append(&self, url: &str) -> Result<(), AppendError> {
        if self.is_private_mode() {
            tracing::debug!("Private mode on, not recording visit");
            return Ok(());
        }
        if url.is_empty() || url.chars().any(char::is_whitespace) {
            return Err(AppendError::InvalidUrl(url.to_string()));
        }

        let record = VisitRecord::now(url);
        let log = Arc::clone(&self.log);
        let records = Arc::clone(&self.records);
        tokio::task::spawn_blocking(move || {
            let mut log = log
                .lock()
                .map_err(|_| AppendError::Unavailable("history writer lock poisoned".into()))?;
            log.append_line(&record.to_line())?;
            records
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(record);
            Ok::<(), AppendError>(())
        })
        .await
        .map_err(|e| AppendError::Unavailable(e.to_string()))?
    }

    /// Snapshot of the full ordered history.
    pub fn load_all(&self) -> Vec<VisitRecord> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_private_mode(&self, enabled: bool) {
        self.private_mode.store(enabled, Ordering::Release);
    }

    pub fn is_private_mode(&self) -> bool {
        self.private_mode.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory log whose next write can be made to fail.
    #[derive(Clone, Default)]
    struct FlakyLog {
        lines: Arc<Mutex<Vec<String>>>,
        fail_next: Arc<AtomicBool>,
    }

    impl DurableLog for FlakyLog {
        fn append_line(&mut self, line: &str) -> io::Result<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(io::Error::other("no space left on device"));
            }
            self.lines.lock().unwrap().push(line.to_string());
            Ok(())
        }
    }

    fn urls(store: &HistoryStore) -> Vec<String> {
        store.load_all().into_iter().map(|r| r.url).collect()
    }

    #[tokio::test]
    async fn append_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path().join("history")).unwrap();
        assert!(store.is_empty());

        store.append("http://a.example.com/").await.unwrap();
        store.append("http://b.example.com/").await.unwrap();
        store.append("http://a.example.com/").await.unwrap();

        assert_eq!(
            urls(&store),
            vec![
                "http://a.example.com/",
                "http://b.example.com/",
                "http://a.example.com/"
            ]
        );
    }

    #[tokio::test]
    async fn history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history");
        {
            let store = HistoryStore::open(&path).unwrap();
            store.append("http://news.example.com/").await.unwrap();
            store.append("http://shop.example.com/cart").await.unwrap();
        }
        let store = HistoryStore::open(&path).unwrap();
        let records = store.load_all();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].url, "http://shop.example.com/cart");
        assert!(records.iter().all(|r| r.timestamp.is_some()));
    }

    #[tokio::test]
    async fn legacy_file_loads_and_accepts_new_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history");
        fs::write(&path, "http://old.example.com/\n\nhttp://older.example.com/\n").unwrap();

        let store = HistoryStore::open(&path).unwrap();
        assert_eq!(
            urls(&store),
            vec!["http://old.example.com/", "http://older.example.com/"]
        );
        store.append("http://new.example.com/").await.unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let last: Vec<&str> = contents
            .lines()
            .filter_map(|l| l.split_whitespace().last())
            .collect();
        assert_eq!(
            last,
            vec![
                "http://old.example.com/",
                "http://older.example.com/",
                "http://new.example.com/"
            ]
        );
    }

    #[tokio::test]
    async fn torn_tail_is_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history");
        fs::write(&path, "http://ok.example.com/\nhttp://tor").unwrap();

        let store = HistoryStore::open(&path).unwrap();
        assert_eq!(urls(&store), vec!["http://ok.example.com/"]);

        store.append("http://next.example.com/").await.unwrap();
        let reopened = HistoryStore::open(&path).unwrap();
        assert_eq!(
            urls(&reopened),
            vec!["http://ok.example.com/", "http://next.example.com/"]
        );
    }

    #[tokio::test]
    async fn private_mode_suppresses_appends() {
        let log = FlakyLog::default();
        let store = HistoryStore::with_log(Vec::new(), Box::new(log.clone()));
        store.append("http://news.example.com/").await.unwrap();
        let before = store.load_all();

        store.set_private_mode(true);
        assert!(store.is_private_mode());
        for _ in 0..5 {
            store.append("http://shop.example.com/").await.unwrap();
        }
        assert_eq!(store.load_all(), before);
        assert_eq!(log.lines.lock().unwrap().len(), 1);

        store.set_private_mode(false);
        store.append("http://shop.example.com/").await.unwrap();
        assert_eq!(store.len(), 2);
        // Entries recorded before private mode stay visible throughout.
        assert_eq!(store.load_all()[0], before[0]);
    }

    #[tokio::test]
    async fn failed_write_leaves_mirror_untouched() {
        let log = FlakyLog::default();
        let store = HistoryStore::with_log(Vec::new(), Box::new(log.clone()));

        log.fail_next.store(true, Ordering::SeqCst);
        let err = store.append("http://lost.example.com/").await.unwrap_err();
        assert!(matches!(err, AppendError::Io(_)));
        assert!(store.is_empty());

        store.append("http://kept.example.com/").await.unwrap();
        assert_eq!(urls(&store), vec!["http://kept.example.com/"]);
        assert_eq!(log.lines.lock().unwrap().len(), 1);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn full_device_surfaces_append_error() {
        if !Path::new("/dev/full").exists() {
            return;
        }
        let log = FileLog::open("/dev/full").unwrap();
        let store = HistoryStore::with_log(Vec::new(), Box::new(log));
        let err = store.append("http://news.example.com/").await.unwrap_err();
        assert!(matches!(err, AppendError::Io(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn whitespace_in_url_is_rejected() {
        let store = HistoryStore::with_log(Vec::new(), Box::new(FlakyLog::default()));
        let err = store.append("http://a b/").await.unwrap_err();
        assert!(matches!(err, AppendError::InvalidUrl(_)));
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history");
        let store = Arc::new(HistoryStore::open(&path).unwrap());

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .append(&format!("http://site{i}.example.com/"))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.len(), 32);
        let reopened = HistoryStore::open(&path).unwrap();
        assert_eq!(reopened.load_all(), store.load_all());
    }
}
