// Durable storage for queue entries

//! # Queue Stores
//!
//! The [`QueueStore`] trait persists [`QueueEntry`] values and hands them out
//! for processing. Two implementations are provided:
//!
//! - [`InMemoryQueueStore`]: entries live as long as the process
//! - [`FileQueueStore`]: every change is written to a JSON file (write to a
//!   temporary file, then rename), so the queue survives restarts
//!
//! Progress notes are kept in memory at once but written to the file at most
//! once per [`PROGRESS_FLUSH_INTERVAL`]; the next state change writes the
//! latest note along with it.
//!
//! When a `FileQueueStore` is opened, entries that were `InProgress` belonged
//! to a process that died mid-flight. They are put back to `Pending` so they
//! are delivered again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{EntryState, QueueEntry};
use crate::{AutomationError, Result};

/// Persistence for queue entries
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Store a new entry, assigning its sequence number
    async fn insert(&self, entry: QueueEntry) -> Result<QueueEntry>;

    /// Atomically take the oldest due entry whose (queue, task type) is in
    /// `eligible`, mark it `InProgress` and count the delivery attempt
    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        eligible: &[(String, String)],
    ) -> Result<Option<QueueEntry>>;

    /// Replace an existing entry
    async fn update(&self, entry: &QueueEntry) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<QueueEntry>>;

    /// Every entry, in insertion order
    async fn list(&self) -> Result<Vec<QueueEntry>>;

    async fn set_progress(&self, id: Uuid, details: &str) -> Result<()>;

    async fn remove(&self, id: Uuid) -> Result<bool>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueState {
    next_sequence: u64,
    entries: BTreeMap<Uuid, QueueEntry>,
}

impl QueueState {
    fn insert(&mut self, mut entry: QueueEntry) -> QueueEntry {
        self.next_sequence += 1;
        entry.sequence = self.next_sequence;
        self.entries.insert(entry.id, entry.clone());
        entry
    }

    fn claim_next(&mut self, now: DateTime<Utc>, eligible: &[(String, String)]) -> Option<QueueEntry> {
        let id = self
            .entries
            .values()
            .filter(|entry| entry.is_due(now))
            .filter(|entry| {
                eligible
                    .iter()
                    .any(|(queue, task)| *queue == entry.queue_id && *task == entry.task_type)
            })
            .min_by_key(|entry| (entry.available_at, entry.sequence))
            .map(|entry| entry.id)?;

        let entry = self.entries.get_mut(&id)?;
        entry.state = EntryState::InProgress;
        entry.attempts += 1;
        entry.started_at = Some(now);
        Some(entry.clone())
    }

    fn update(&mut self, entry: &QueueEntry) -> Result<()> {
        match self.entries.get_mut(&entry.id) {
            Some(existing) => {
                *existing = entry.clone();
                Ok(())
            }
            None => Err(AutomationError::Queue(format!("unknown queue entry {}", entry.id))),
        }
    }

    fn list(&self) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self.entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.sequence);
        entries
    }

    fn set_progress(&mut self, id: Uuid, details: &str) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| AutomationError::Queue(format!("unknown queue entry {}", id)))?;
        entry.progress = Some(details.to_string());
        Ok(())
    }
}

/// Queue store that keeps entries in memory
#[derive(Default)]
pub struct InMemoryQueueStore {
    state: Mutex<QueueState>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn insert(&self, entry: QueueEntry) -> Result<QueueEntry> {
        Ok(self.state.lock().await.insert(entry))
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        eligible: &[(String, String)],
    ) -> Result<Option<QueueEntry>> {
        Ok(self.state.lock().await.claim_next(now, eligible))
    }

    async fn update(&self, entry: &QueueEntry) -> Result<()> {
        self.state.lock().await.update(entry)
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueueEntry>> {
        Ok(self.state.lock().await.entries.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.state.lock().await.list())
    }

    async fn set_progress(&self, id: Uuid, details: &str) -> Result<()> {
        self.state.lock().await.set_progress(id, details)
    }

    async fn remove(&self, id: Uuid) -> Result<bool> {
        Ok(self.state.lock().await.entries.remove(&id).is_some())
    }
}

/// Minimum time between two file writes caused only by progress updates
pub const PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Queue store persisted to a JSON file
pub struct FileQueueStore {
    path: PathBuf,
    state: Mutex<QueueState>,
    progress_flushed: Mutex<Option<Instant>>,
}

impl FileQueueStore {
    /// Open (or create) the store at `path`, recovering interrupted entries
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut state = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str::<QueueState>(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => QueueState::default(),
            Err(e) => return Err(e.into()),
        };

        let mut recovered = 0;
        for entry in state.entries.values_mut() {
            if entry.state == EntryState::InProgress {
                entry.state = EntryState::Pending;
                entry.last_error = Some("interrupted by restart".to_string());
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!(recovered, path = %path.display(), "Re-queued entries interrupted by a restart");
        }
        info!(entries = state.entries.len(), path = %path.display(), "Opened queue store");

        let store = Self {
            path,
            state: Mutex::new(state),
            progress_flushed: Mutex::new(None),
        };
        {
            let state = store.state.lock().await;
            store.persist(&state).await?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, state: &QueueState) -> Result<()> {
        let contents = serde_json::to_vec_pretty(state)?;
        let mut temporary = self.path.clone().into_os_string();
        temporary.push(".tmp");
        let temporary = PathBuf::from(temporary);
        tokio::fs::write(&temporary, contents).await?;
        tokio::fs::rename(&temporary, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn insert(&self, entry: QueueEntry) -> Result<QueueEntry> {
        let mut state = self.state.lock().await;
        let entry = state.insert(entry);
        self.persist(&state).await?;
        Ok(entry)
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        eligible: &[(String, String)],
    ) -> Result<Option<QueueEntry>> {
        let mut state = self.state.lock().await;
        let claimed = state.claim_next(now, eligible);
        if claimed.is_some() {
            self.persist(&state).await?;
        }
        Ok(claimed)
    }

    async fn update(&self, entry: &QueueEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        state.update(entry)?;
        self.persist(&state).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueueEntry>> {
        Ok(self.state.lock().await.entries.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.state.lock().await.list())
    }

    async fn set_progress(&self, id: Uuid, details: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.set_progress(id, details)?;
        let mut flushed = self.progress_flushed.lock().await;
        if flushed.map_or(false, |at| at.elapsed() < PROGRESS_FLUSH_INTERVAL) {
            return Ok(());
        }
        self.persist(&state).await?;
        *flushed = Some(Instant::now());
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        let removed = state.entries.remove(&id).is_some();
        if removed {
            self.persist(&state).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransactionMode;
    use std::time::Duration;

    fn entry(task_type: &str) -> QueueEntry {
        QueueEntry::new("queue", task_type, TransactionMode::Unsafe, serde_json::json!({}), None)
    }

    fn eligible(task_types: &[&str]) -> Vec<(String, String)> {
        task_types
            .iter()
            .map(|t| ("queue".to_string(), t.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_marks_in_progress() {
        let store = InMemoryQueueStore::new();
        let first = store.insert(entry("a")).await.unwrap();
        let second = store.insert(entry("a")).await.unwrap();
        assert!(second.sequence > first.sequence);

        let claimed = store.claim_next(Utc::now(), &eligible(&["a"])).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.state, EntryState::InProgress);
        assert_eq!(claimed.attempts, 1);

        let next = store.claim_next(Utc::now(), &eligible(&["a"])).await.unwrap().unwrap();
        assert_eq!(next.id, second.id);
        assert!(store.claim_next(Utc::now(), &eligible(&["a"])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_skips_unregistered_and_delayed_entries() {
        let store = InMemoryQueueStore::new();
        store.insert(entry("unknown")).await.unwrap();
        store
            .insert(entry("a").available_after(Duration::from_secs(3600)))
            .await
            .unwrap();

        assert!(store.claim_next(Utc::now(), &eligible(&["a"])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_recovers_in_progress_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let id = {
            let store = FileQueueStore::open(&path).await.unwrap();
            let inserted = store.insert(entry("a")).await.unwrap();
            store.claim_next(Utc::now(), &eligible(&["a"])).await.unwrap().unwrap();
            store.set_progress(inserted.id, "Updated 3").await.unwrap();
            inserted.id
        };

        let reopened = FileQueueStore::open(&path).await.unwrap();
        let recovered = reopened.get(id).await.unwrap().unwrap();
        assert_eq!(recovered.state, EntryState::Pending);
        assert_eq!(recovered.attempts, 1);
        assert_eq!(recovered.progress.as_deref(), Some("Updated 3"));

        let again = reopened.claim_next(Utc::now(), &eligible(&["a"])).await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn test_file_store_throttles_progress_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let store = FileQueueStore::open(&path).await.unwrap();
        let inserted = store.insert(entry("a")).await.unwrap();

        store.set_progress(inserted.id, "Updated 1").await.unwrap();
        for n in 2..=50 {
            store.set_progress(inserted.id, &format!("Updated {}", n)).await.unwrap();
        }

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(on_disk.contains("Updated 1"));
        assert!(!on_disk.contains("Updated 50"));
        let current = store.get(inserted.id).await.unwrap().unwrap();
        assert_eq!(current.progress.as_deref(), Some("Updated 50"));

        // The next state change carries the latest note to disk.
        let mut finished = current;
        finished.state = EntryState::Done;
        store.update(&finished).await.unwrap();
        let reopened = FileQueueStore::open(&path).await.unwrap();
        let loaded = reopened.get(inserted.id).await.unwrap().unwrap();
        assert_eq!(loaded.progress.as_deref(), Some("Updated 50"));
    }

    #[tokio::test]
    async fn test_update_unknown_entry_fails() {
        let store = InMemoryQueueStore::new();
        assert!(store.update(&entry("a")).await.is_err());
        assert!(!store.remove(Uuid::new_v4()).await.unwrap());
    }
}
