//! Durable transaction store.
//!
//! The in-memory map is authoritative. Mutations mark the store dirty and are written
//! out by a background flusher; critical transitions use [`TransactionStore::put_durable`]
//! to hit disk before the caller proceeds. Shutdown always performs a final flush.

mod persistence;

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::MIN_RETENTION_HOURS;
use crate::domain::TransactionRecord;
use persistence::LoadOutcome;

pub use persistence::SNAPSHOT_VERSION;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("store task failed: {0}")]
    Task(String),
    #[error("store file is unreadable: {0}")]
    Unreadable(String),
}

struct Inner {
    records: RwLock<HashMap<String, TransactionRecord>>,
    dirty: AtomicBool,
    path: Option<PathBuf>,
    /// Serializes file writes so snapshots land in order.
    flush_lock: Mutex<()>,
}

#[derive(Clone)]
pub struct TransactionStore {
    inner: Arc<Inner>,
}

impl TransactionStore {
    /// Loads the store from `path`, dropping records older than `retention`.
    ///
    /// A missing file starts an empty store. An unreadable one is moved aside as
    /// `<path>.corrupt-<unix-ts>` and the store starts empty.
    pub fn open(path: impl Into<PathBuf>, retention: ChronoDuration) -> Result<Self, StoreError> {
        let path = path.into();
        let mut records = match persistence::load(&path)? {
            LoadOutcome::Missing => {
                tracing::info!(path = %path.display(), "No store file found, starting empty");
                HashMap::new()
            }
            LoadOutcome::Loaded(records) => records,
            LoadOutcome::Quarantined(moved_to) => {
                tracing::error!(
                    path = %path.display(),
                    quarantined = %moved_to.display(),
                    "Store file quarantined, starting empty"
                );
                HashMap::new()
            }
        };

        let cutoff = Utc::now() - clamp_retention(retention);
        let before = records.len();
        records.retain(|_, record| record.updated_at >= cutoff);
        let expired = before - records.len();

        tracing::info!(
            path = %path.display(),
            records = records.len(),
            expired,
            "Transaction store loaded"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                records: RwLock::new(records),
                dirty: AtomicBool::new(expired > 0),
                path: Some(path),
                flush_lock: Mutex::new(()),
            }),
        })
    }

    /// Loads a snapshot for inspection. The file is never written, renamed or
    /// quarantined, and later mutations stay in memory.
    pub fn open_read_only(path: &Path, retention: ChronoDuration) -> Result<Self, StoreError> {
        let mut records = persistence::load_read_only(path)?.unwrap_or_default();
        let cutoff = Utc::now() - clamp_retention(retention);
        records.retain(|_, record| record.updated_at >= cutoff);

        Ok(Self::detached(records))
    }

    /// A store with no backing file. Flushes are no-ops.
    pub fn in_memory() -> Self {
        Self::detached(HashMap::new())
    }

    fn detached(records: HashMap<String, TransactionRecord>) -> Self {
        Self {
            inner: Arc::new(Inner {
                records: RwLock::new(records),
                dirty: AtomicBool::new(false),
                path: None,
                flush_lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub async fn has(&self, reference: &str) -> bool {
        self.inner.records.read().await.contains_key(reference)
    }

    pub async fn get(&self, reference: &str) -> Option<TransactionRecord> {
        self.inner.records.read().await.get(reference).cloned()
    }

    pub async fn all(&self) -> Vec<TransactionRecord> {
        let mut records: Vec<_> = self.inner.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    pub async fn len(&self) -> usize {
        self.inner.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Upserts the record, stamps `updated_at` and schedules a flush.
    pub async fn put(&self, mut record: TransactionRecord) {
        record.updated_at = Utc::now();
        let mut records = self.inner.records.write().await;
        records.insert(record.reference.clone(), record);
        self.inner.dirty.store(true, Ordering::SeqCst);
    }

    /// Inserts a brand-new record. Returns `false` without touching the store if the
    /// reference is already taken.
    pub async fn create(&self, mut record: TransactionRecord) -> bool {
        let mut records = self.inner.records.write().await;
        if records.contains_key(&record.reference) {
            return false;
        }
        record.updated_at = Utc::now();
        records.insert(record.reference.clone(), record);
        self.inner.dirty.store(true, Ordering::SeqCst);
        true
    }

    /// Upserts the record and flushes before returning.
    pub async fn put_durable(&self, record: TransactionRecord) -> Result<(), StoreError> {
        self.put(record).await;
        self.flush().await
    }

    /// Writes the current snapshot if anything changed since the last flush.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = self.inner.path.clone() else {
            self.inner.dirty.store(false, Ordering::SeqCst);
            return Ok(());
        };

        let _guard = self.inner.flush_lock.lock().await;
        if !self.inner.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let snapshot = self.inner.records.read().await.clone();
        let result = tokio::task::spawn_blocking(move || persistence::write_atomic(&path, &snapshot))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))
            .and_then(|r| r);

        if let Err(e) = &result {
            self.inner.dirty.store(true, Ordering::SeqCst);
            tracing::error!(error = %e, "Failed to flush transaction store");
        }
        result
    }

    /// Flushes every `interval` while the store is dirty.
    pub fn spawn_flusher(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.flush().await {
                    tracing::warn!(error = %e, "Periodic store flush failed, will retry");
                }
            }
        })
    }

    /// Final synchronous flush. Must run after in-flight reconciliations drain.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.inner.dirty.store(true, Ordering::SeqCst);
        self.flush().await?;
        tracing::info!(records = self.len().await, "Transaction store flushed on shutdown");
        Ok(())
    }

    /// Removes records whose `updated_at` is older than `max_age`. Ages below the
    /// minimum retention are raised to it.
    pub async fn cleanup(&self, max_age: ChronoDuration) -> usize {
        let cutoff = Utc::now() - clamp_retention(max_age);
        let mut records = self.inner.records.write().await;
        let before = records.len();
        records.retain(|_, record| record.updated_at >= cutoff);
        let removed = before - records.len();
        if removed > 0 {
            self.inner.dirty.store(true, Ordering::SeqCst);
        }
        removed
    }

    #[cfg(test)]
    pub(crate) async fn insert_raw(&self, record: TransactionRecord) {
        self.inner
            .records
            .write()
            .await
            .insert(record.reference.clone(), record);
        self.inner.dirty.store(true, Ordering::SeqCst);
    }
}

fn clamp_retention(max_age: ChronoDuration) -> ChronoDuration {
    max_age.max(ChronoDuration::hours(MIN_RETENTION_HOURS as i64))
}
