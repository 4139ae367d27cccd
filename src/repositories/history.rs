use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sonic_rs::LazyValue;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{AppError, Result};
use crate::models::history::HistoryBook;

/// The history database: one JSON document mapping identity keys to histories.
///
/// The document is always read and written whole. Every load→mutate→save
/// cycle must run under the guard returned by [`HistoryStore::lock`], which
/// makes quota checks and appends linearizable across concurrent requests.
pub struct HistoryStore {
    path: PathBuf,
    cap: usize,
    lock: Mutex<()>,
}

/// Exclusive access to the history database for one load→mutate→save cycle.
pub struct HistoryGuard<'a> {
    store: &'a HistoryStore,
    _guard: MutexGuard<'a, ()>,
}

impl HistoryStore {
    /// Creates a new `HistoryStore`.
    ///
    /// # Arguments
    ///
    /// * `path` - The JSON file backing the store. It does not need to exist yet.
    /// * `cap` - The maximum number of entries kept per identity.
    pub fn new(path: impl Into<PathBuf>, cap: usize) -> Self {
        Self {
            path: path.into(),
            cap,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for exclusive access to the database.
    pub async fn lock(&self) -> HistoryGuard<'_> {
        HistoryGuard {
            store: self,
            _guard: self.lock.lock().await,
        }
    }

    /// Loads a consistent snapshot for read-only use.
    pub async fn snapshot(&self) -> HistoryBook {
        self.lock().await.load().await
    }

    async fn read(&self) -> HistoryBook {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("History DB {} not found - starting empty", self.path.display());
                return HistoryBook::empty(self.cap);
            }
            Err(e) => {
                tracing::error!(
                    "Failed to read history DB {}: {} - serving empty, writes disabled",
                    self.path.display(),
                    e
                );
                return HistoryBook::detached(self.cap);
            }
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return HistoryBook::empty(self.cap);
        }

        let e = match sonic_rs::from_slice::<BTreeMap<String, LazyValue<'_>>>(&bytes) {
            Ok(raw) => {
                return HistoryBook::from_raw(
                    raw.iter().map(|(key, value)| (key.clone(), value.as_raw_str())),
                    self.cap,
                );
            }
            Err(e) => e,
        };

        let quarantine = self.sibling("corrupt");
        match tokio::fs::rename(&self.path, &quarantine).await {
            Ok(()) => {
                tracing::warn!(
                    "History DB {} is unreadable: {} - moved to {} and starting empty",
                    self.path.display(),
                    e,
                    quarantine.display()
                );
                HistoryBook::empty(self.cap)
            }
            Err(re) => {
                tracing::error!(
                    "History DB {} is unreadable ({}) and could not be moved aside: {} - writes disabled",
                    self.path.display(),
                    e,
                    re
                );
                HistoryBook::detached(self.cap)
            }
        }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(".");
        path.push(suffix);
        PathBuf::from(path)
    }

    async fn write(&self, book: &HistoryBook) -> Result<()> {
        if !book.is_writable() {
            return Err(AppError::Persistence(format!(
                "{} could not be read; refusing to overwrite it",
                self.path.display()
            )));
        }

        let body = book
            .to_json()
            .map_err(|e| AppError::Persistence(format!("serialization failed: {}", e)))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Persistence(format!("{}: {}", parent.display(), e)))?;
        }

        // Write beside the target and rename so readers never see a torn file.
        let tmp = self.sibling("tmp");

        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| AppError::Persistence(format!("{}: {}", tmp.display(), e)))?;

        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(AppError::Persistence(format!("{}: {}", self.path.display(), e)));
        }

        tracing::debug!("History DB saved ({} keys)", book.len());
        Ok(())
    }
}

impl HistoryGuard<'_> {
    /// Loads the whole database. A missing file yields an empty book; an
    /// unparseable one is moved aside to `<path>.corrupt` first. A file that
    /// cannot be read at all yields a detached book that refuses to be saved.
    pub async fn load(&self) -> HistoryBook {
        self.store.read().await
    }

    /// Rewrites the whole database.
    pub async fn save(&self, book: &HistoryBook) -> Result<()> {
        self.store.write(book).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::history::{AnonRecord, UsageRecord};

    fn store_in(dir: &tempfile::TempDir) -> HistoryStore {
        HistoryStore::new(dir.path().join("history_db.json"), 100)
    }

    /// A store whose file reads fine but whose temp file cannot be created.
    fn unwritable_store(dir: &tempfile::TempDir) -> HistoryStore {
        let path = dir.path().join("history_db.json");
        std::fs::create_dir(dir.path().join("history_db.json.tmp")).unwrap();
        HistoryStore::new(path, 100)
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let book = store_in(&dir).snapshot().await;
        assert!(book.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_moved_aside_before_loading_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        tokio::fs::write(store.path(), b"{not json").await.unwrap();

        let guard = store.lock().await;
        let mut book = guard.load().await;
        assert!(book.is_empty());
        book.put_history("sub", vec![UsageRecord::new("x")]);
        guard.save(&book).await.unwrap();

        let kept = tokio::fs::read(dir.path().join("history_db.json.corrupt")).await.unwrap();
        assert_eq!(kept, b"{not json");
    }

    #[tokio::test]
    async fn mixed_legacy_file_survives_an_unrelated_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        tokio::fs::write(
            store.path(),
            br#"{"alice":[{"caption":"hi","timestamp":1.0,"source":"web"}],"bob":[{"caption":"legacy"}],"anon:1":{"count":1,"items":[]}}"#,
        )
        .await
        .unwrap();

        {
            let guard = store.lock().await;
            let mut book = guard.load().await;
            assert_eq!(book.get_history("bob")[0].caption, "legacy");
            book.put_history("carol", vec![UsageRecord::new("x")]);
            guard.save(&book).await.unwrap();
        }

        let book = store.snapshot().await;
        assert_eq!(book.get_history("alice")[0].caption, "hi");
        assert_eq!(book.get_history("bob")[0].caption, "legacy");
        assert_eq!(book.get_history("carol")[0].caption, "x");
        assert_eq!(book.get_anon_record("anon:1").count, 1);

        let raw = tokio::fs::read_to_string(store.path()).await.unwrap();
        assert!(raw.contains(r#""source":"web""#));
    }

    #[tokio::test]
    async fn save_then_load_keeps_both_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        {
            let guard = store.lock().await;
            let mut book = guard.load().await;
            book.put_history("sub-1", vec![UsageRecord::new("a cat")]);
            book.put_anon_record(
                "anon:abc",
                AnonRecord {
                    count: 1,
                    items: vec![UsageRecord::new("a dog")],
                },
            );
            guard.save(&book).await.unwrap();
        }

        let book = store.snapshot().await;
        assert_eq!(book.get_history("sub-1")[0].caption, "a cat");
        let anon = book.get_anon_record("anon:abc");
        assert_eq!(anon.count, 1);
        assert_eq!(anon.items[0].caption, "a dog");
        assert!(!dir.path().join("history_db.json.tmp").exists());
    }

    #[tokio::test]
    async fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("nested/deeper/db.json"), 100);

        let guard = store.lock().await;
        let mut book = guard.load().await;
        book.put_history("sub", vec![UsageRecord::new("x")]);
        guard.save(&book).await.unwrap();

        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn unwritable_location_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = unwritable_store(&dir);

        let guard = store.lock().await;
        let book = guard.load().await;
        assert!(matches!(guard.save(&book).await, Err(AppError::Persistence(_))));
    }

    #[tokio::test]
    async fn unreadable_file_loads_empty_but_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        tokio::fs::write(&blocker, b"file, not a directory").await.unwrap();
        let store = HistoryStore::new(blocker.join("db.json"), 100);

        let guard = store.lock().await;
        let mut book = guard.load().await;
        assert!(book.is_empty());
        assert!(!book.is_writable());
        book.put_history("sub", vec![UsageRecord::new("x")]);
        assert!(matches!(guard.save(&book).await, Err(AppError::Persistence(_))));
    }
}
