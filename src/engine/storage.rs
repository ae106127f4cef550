// In-memory repository backend
// Reference implementation of the Repository boundary for tests and local runs

//! # In-Memory Repository
//!
//! [`InMemoryRepository`] implements [`Repository`] on top of a `BTreeMap` of
//! records, which keeps searches ordered by [`RecordRef`] and makes keyset
//! pagination trivial.
//!
//! ## Transactions
//!
//! Transactions write straight into the shared state and keep an undo journal.
//! `rollback` replays the journal backwards; `commit` either discards it or,
//! for a nested transaction, hands it to the parent so an outer rollback still
//! undoes the inner work. Other readers can observe uncommitted changes; edit
//! locks are what keep writers apart.
//!
//! An edit lock taken inside a transaction outlives `unlock`: the handle is
//! spent, but the record stays locked until the outermost transaction commits
//! or rolls back. Nested commits hand their locks to the parent together with
//! their journal. The same transaction chain may lock the record again.
//!
//! ## Thread Safety
//!
//! All state sits behind one `tokio::sync::RwLock`. Reads share it, every
//! mutation takes it exclusively, so each repository call is atomic.
//!
//! ## Rust Learning Notes:
//!
//! This file demonstrates:
//! - Sharing state between handles with `Arc`
//! - Async locks (`tokio::sync::RwLock`, `Mutex`) that cannot be poisoned
//! - `std::ops::Bound` for range queries over ordered maps
//! - Atomic flags (`AtomicBool`) for one-shot state transitions

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use super::repository::{
    LockHandle, PageRequest, Repository, RepositoryTransaction, SharedLink, SharedLinkRequest,
};
use crate::models::{
    NewRecord, ObjectTypeId, ObjectTypeInfo, PropertyChanges, Record, RecordRef, SearchFilter,
};
use crate::{AutomationError, Result};

/// Initial repository contents, loadable from JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositorySeed {
    #[serde(default)]
    pub object_types: Vec<ObjectTypeInfo>,
    #[serde(default)]
    pub records: Vec<Record>,
}

#[derive(Debug, Clone)]
struct LockInfo {
    lock_id: Uuid,
    holder: String,
    /// Root transaction owning the lock, if it was taken inside one
    owner: Option<Uuid>,
    /// Unlocked by its handle, held until `owner` finishes
    released: bool,
}

#[derive(Debug, Default)]
struct VaultState {
    records: BTreeMap<RecordRef, Record>,
    object_types: HashMap<ObjectTypeId, ObjectTypeInfo>,
    next_ids: HashMap<ObjectTypeId, i64>,
    locks: HashMap<RecordRef, LockInfo>,
    shared_links: Vec<SharedLink>,
}

impl VaultState {
    /// Record as seen by callers, with the lock holder filled in
    fn visible(&self, record: &Record) -> Record {
        let mut record = record.clone();
        record.checked_out_to = self
            .locks
            .get(&record.reference)
            .map(|lock| lock.holder.clone());
        record
    }

    fn check_lock(&self, handle: &LockHandle) -> Result<()> {
        match self.locks.get(&handle.record) {
            Some(lock) if lock.lock_id == handle.lock_id && !lock.released => Ok(()),
            _ => Err(AutomationError::NotLocked(handle.record)),
        }
    }

    fn insert(&mut self, record: Record) {
        let next = self.next_ids.entry(record.reference.object_type).or_insert(1);
        if record.reference.id >= *next {
            *next = record.reference.id + 1;
        }
        self.records.insert(record.reference, record);
    }
}

#[derive(Debug)]
enum UndoEntry {
    Restore(Record),
    Remove(RecordRef),
    RemoveLink(String),
}

/// Journal and lock bookkeeping of one open transaction
#[derive(Clone)]
struct TxScope {
    /// Shared by a root transaction and everything nested in it
    root: Uuid,
    journal: Arc<Mutex<Vec<UndoEntry>>>,
    locks: Arc<Mutex<Vec<(RecordRef, Uuid)>>>,
}

impl TxScope {
    fn new(parent: Option<&TxScope>) -> Self {
        Self {
            root: parent.map_or_else(Uuid::new_v4, |p| p.root),
            journal: Arc::default(),
            locks: Arc::default(),
        }
    }
}

struct Shared {
    state: RwLock<VaultState>,
    vault_id: Uuid,
}

impl Shared {
    async fn journal(scope: Option<&TxScope>, entry: UndoEntry) {
        if let Some(scope) = scope {
            scope.journal.lock().await.push(entry);
        }
    }

    async fn get_record(&self, record: &RecordRef) -> Result<Option<Record>> {
        let state = self.state.read().await;
        Ok(state.records.get(record).map(|r| state.visible(r)))
    }

    async fn object_type(&self, object_type: ObjectTypeId) -> Result<Option<ObjectTypeInfo>> {
        Ok(self.state.read().await.object_types.get(&object_type).cloned())
    }

    async fn search(&self, filter: &SearchFilter, page: PageRequest) -> Result<Vec<Record>> {
        let state = self.state.read().await;
        let lower = match page.after {
            Some(after) => Bound::Excluded(after),
            None => Bound::Unbounded,
        };
        Ok(state
            .records
            .range((lower, Bound::Unbounded))
            .map(|(_, record)| state.visible(record))
            .filter(|record| filter.matches(record))
            .take(page.limit)
            .collect())
    }

    async fn count(&self, filter: &SearchFilter) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|record| filter.matches(&state.visible(record)))
            .count() as u64)
    }

    async fn lock(&self, record: &RecordRef, actor: &str, scope: Option<&TxScope>) -> Result<LockHandle> {
        let mut state = self.state.write().await;
        if !state.records.contains_key(record) {
            return Err(AutomationError::RecordNotFound(*record));
        }
        let owner = scope.map(|scope| scope.root);
        if let Some(existing) = state.locks.get_mut(record) {
            // A lock this transaction chain released earlier is taken over;
            // it is already tracked by the scope that took it.
            if existing.released && owner.is_some() && existing.owner == owner {
                existing.released = false;
                existing.holder = actor.to_string();
                return Ok(LockHandle {
                    record: *record,
                    lock_id: existing.lock_id,
                    holder: existing.holder.clone(),
                });
            }
            return Err(AutomationError::AlreadyLocked {
                record: *record,
                holder: existing.holder.clone(),
            });
        }
        let handle = LockHandle {
            record: *record,
            lock_id: Uuid::new_v4(),
            holder: actor.to_string(),
        };
        state.locks.insert(
            *record,
            LockInfo {
                lock_id: handle.lock_id,
                holder: handle.holder.clone(),
                owner,
                released: false,
            },
        );
        if let Some(scope) = scope {
            scope.locks.lock().await.push((*record, handle.lock_id));
        }
        Ok(handle)
    }

    async fn save_properties(
        &self,
        handle: &LockHandle,
        changes: &PropertyChanges,
        scope: Option<&TxScope>,
    ) -> Result<Record> {
        let mut state = self.state.write().await;
        state.check_lock(handle)?;
        let record = state
            .records
            .get_mut(&handle.record)
            .ok_or(AutomationError::RecordNotFound(handle.record))?;
        let previous = record.clone();
        changes.apply_to(record);
        let updated = record.clone();
        Self::journal(scope, UndoEntry::Restore(previous)).await;
        Ok(state.visible(&updated))
    }

    async fn unlock(&self, handle: LockHandle) -> Result<()> {
        let mut state = self.state.write().await;
        state.check_lock(&handle)?;
        match state.locks.get_mut(&handle.record) {
            Some(lock) if lock.owner.is_some() => lock.released = true,
            _ => {
                state.locks.remove(&handle.record);
            }
        }
        Ok(())
    }

    async fn create_record(&self, new: NewRecord, scope: Option<&TxScope>) -> Result<RecordRef> {
        let mut state = self.state.write().await;
        let next = state.next_ids.entry(new.object_type).or_insert(1);
        let reference = RecordRef::new(new.object_type, *next);
        *next += 1;

        let mut record = Record::new(reference, new.class, new.title);
        record.properties = new.properties;
        record.files = new.files;
        record.external_id = new.external_id;
        record.modified_by = new.created_by;
        record.version_comment = new.comment;
        state.records.insert(reference, record);
        Self::journal(scope, UndoEntry::Remove(reference)).await;
        debug!(record = %reference, "Created record");
        Ok(reference)
    }

    async fn destroy_record(&self, record: &RecordRef, scope: Option<&TxScope>) -> Result<()> {
        let mut state = self.state.write().await;
        let owner = scope.map(|scope| scope.root);
        if let Some(lock) = state
            .locks
            .get(record)
            .filter(|lock| !(lock.released && owner.is_some() && lock.owner == owner))
        {
            return Err(AutomationError::AlreadyLocked {
                record: *record,
                holder: lock.holder.clone(),
            });
        }
        let removed = state
            .records
            .remove(record)
            .ok_or(AutomationError::RecordNotFound(*record))?;
        Self::journal(scope, UndoEntry::Restore(removed)).await;
        Ok(())
    }

    async fn create_shared_link(
        &self,
        request: SharedLinkRequest,
        scope: Option<&TxScope>,
    ) -> Result<SharedLink> {
        let mut state = self.state.write().await;
        let record = state
            .records
            .get(&request.record)
            .ok_or(AutomationError::RecordNotFound(request.record))?;
        if !record.files.iter().any(|f| f.file_name() == request.file_name) {
            return Err(AutomationError::Validation(format!(
                "Record {} has no file named '{}'",
                request.record, request.file_name
            )));
        }
        let link = SharedLink {
            access_key: Uuid::new_v4().simple().to_string(),
            record: request.record,
            file_name: request.file_name,
            expires_at: request.expires_at,
            description: request.description,
        };
        state.shared_links.push(link.clone());
        Self::journal(scope, UndoEntry::RemoveLink(link.access_key.clone())).await;
        Ok(link)
    }

    /// Undo journal entries newest first, then drop the scope's locks
    async fn undo(&self, scope: &TxScope) {
        let mut state = self.state.write().await;
        let mut journal = scope.journal.lock().await;
        while let Some(entry) = journal.pop() {
            match entry {
                UndoEntry::Restore(record) => {
                    state.records.insert(record.reference, record);
                }
                UndoEntry::Remove(reference) => {
                    state.records.remove(&reference);
                }
                UndoEntry::RemoveLink(key) => state.shared_links.retain(|l| l.access_key != key),
            }
        }
        Self::release_scope_locks(&mut state, scope).await;
    }

    async fn release_scope_locks(state: &mut VaultState, scope: &TxScope) {
        let mut locks = scope.locks.lock().await;
        for (record, lock_id) in locks.drain(..) {
            if state.locks.get(&record).map(|l| l.lock_id) == Some(lock_id) {
                state.locks.remove(&record);
            }
        }
    }
}

/// Repository held entirely in memory
#[derive(Clone)]
pub struct InMemoryRepository {
    shared: Arc<Shared>,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(VaultState::default()),
                vault_id: Uuid::new_v4(),
            }),
        }
    }

    pub fn from_seed(seed: RepositorySeed) -> Self {
        let mut state = VaultState::default();
        for object_type in seed.object_types {
            state.object_types.insert(object_type.id, object_type);
        }
        for record in seed.records {
            state.insert(record);
        }
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(state),
                vault_id: Uuid::new_v4(),
            }),
        }
    }

    /// Load a seed from a JSON file
    pub async fn load_seed(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        let seed: RepositorySeed = serde_json::from_str(&contents)?;
        Ok(Self::from_seed(seed))
    }

    pub async fn register_object_type(&self, object_type: ObjectTypeInfo) {
        let mut state = self.shared.state.write().await;
        state.object_types.insert(object_type.id, object_type);
    }

    /// Insert or replace a record as-is
    pub async fn insert_record(&self, record: Record) {
        self.shared.state.write().await.insert(record);
    }

    /// All records, ordered by reference
    pub async fn records(&self) -> Vec<Record> {
        let state = self.shared.state.read().await;
        state.records.values().map(|r| state.visible(r)).collect()
    }

    pub async fn shared_links(&self) -> Vec<SharedLink> {
        self.shared.state.read().await.shared_links.clone()
    }

    pub async fn lock_holder(&self, record: &RecordRef) -> Option<String> {
        let state = self.shared.state.read().await;
        state.locks.get(record).map(|lock| lock.holder.clone())
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_record(&self, record: &RecordRef) -> Result<Option<Record>> {
        self.shared.get_record(record).await
    }

    async fn object_type(&self, object_type: ObjectTypeId) -> Result<Option<ObjectTypeInfo>> {
        self.shared.object_type(object_type).await
    }

    async fn search(&self, filter: &SearchFilter, page: PageRequest) -> Result<Vec<Record>> {
        self.shared.search(filter, page).await
    }

    async fn count(&self, filter: &SearchFilter) -> Result<u64> {
        self.shared.count(filter).await
    }

    async fn lock(&self, record: &RecordRef, actor: &str) -> Result<LockHandle> {
        self.shared.lock(record, actor, None).await
    }

    async fn save_properties(&self, handle: &LockHandle, changes: &PropertyChanges) -> Result<Record> {
        self.shared.save_properties(handle, changes, None).await
    }

    async fn unlock(&self, handle: LockHandle) -> Result<()> {
        self.shared.unlock(handle).await
    }

    async fn create_record(&self, record: NewRecord) -> Result<RecordRef> {
        self.shared.create_record(record, None).await
    }

    async fn destroy_record(&self, record: &RecordRef) -> Result<()> {
        self.shared.destroy_record(record, None).await
    }

    async fn create_shared_link(&self, request: SharedLinkRequest) -> Result<SharedLink> {
        self.shared.create_shared_link(request, None).await
    }

    fn vault_id(&self) -> Uuid {
        self.shared.vault_id
    }

    async fn begin(&self) -> Result<Arc<dyn RepositoryTransaction>> {
        Ok(Arc::new(InMemoryTransaction::new(self.shared.clone(), None)))
    }
}

/// Unit of work over an [`InMemoryRepository`]
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    scope: TxScope,
    parent: Option<TxScope>,
    finished: AtomicBool,
}

impl InMemoryTransaction {
    fn new(shared: Arc<Shared>, parent: Option<TxScope>) -> Self {
        Self {
            shared,
            scope: TxScope::new(parent.as_ref()),
            parent,
            finished: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(AutomationError::Conflict(
                "transaction has already been committed or rolled back".into(),
            ));
        }
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(AutomationError::Conflict(
                "transaction has already been committed or rolled back".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for InMemoryTransaction {
    async fn get_record(&self, record: &RecordRef) -> Result<Option<Record>> {
        self.shared.get_record(record).await
    }

    async fn object_type(&self, object_type: ObjectTypeId) -> Result<Option<ObjectTypeInfo>> {
        self.shared.object_type(object_type).await
    }

    async fn search(&self, filter: &SearchFilter, page: PageRequest) -> Result<Vec<Record>> {
        self.shared.search(filter, page).await
    }

    async fn count(&self, filter: &SearchFilter) -> Result<u64> {
        self.shared.count(filter).await
    }

    async fn lock(&self, record: &RecordRef, actor: &str) -> Result<LockHandle> {
        self.ensure_open()?;
        self.shared.lock(record, actor, Some(&self.scope)).await
    }

    async fn save_properties(&self, handle: &LockHandle, changes: &PropertyChanges) -> Result<Record> {
        self.ensure_open()?;
        self.shared.save_properties(handle, changes, Some(&self.scope)).await
    }

    async fn unlock(&self, handle: LockHandle) -> Result<()> {
        self.ensure_open()?;
        self.shared.unlock(handle).await
    }

    async fn create_record(&self, record: NewRecord) -> Result<RecordRef> {
        self.ensure_open()?;
        self.shared.create_record(record, Some(&self.scope)).await
    }

    async fn destroy_record(&self, record: &RecordRef) -> Result<()> {
        self.ensure_open()?;
        self.shared.destroy_record(record, Some(&self.scope)).await
    }

    async fn create_shared_link(&self, request: SharedLinkRequest) -> Result<SharedLink> {
        self.ensure_open()?;
        self.shared.create_shared_link(request, Some(&self.scope)).await
    }

    fn vault_id(&self) -> Uuid {
        self.shared.vault_id
    }

    async fn begin(&self) -> Result<Arc<dyn RepositoryTransaction>> {
        self.ensure_open()?;
        Ok(Arc::new(InMemoryTransaction::new(
            self.shared.clone(),
            Some(self.scope.clone()),
        )))
    }
}

#[async_trait]
impl RepositoryTransaction for InMemoryTransaction {
    async fn commit(&self) -> Result<()> {
        self.finish()?;
        match &self.parent {
            Some(parent) => {
                let mut entries = self.scope.journal.lock().await;
                parent.journal.lock().await.extend(entries.drain(..));
                let mut locks = self.scope.locks.lock().await;
                parent.locks.lock().await.extend(locks.drain(..));
            }
            None => {
                let mut state = self.shared.state.write().await;
                Shared::release_scope_locks(&mut state, &self.scope).await;
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.finish()?;
        self.shared.undo(&self.scope).await;
        Ok(())
    }

    fn as_repository(self: Arc<Self>) -> Arc<dyn Repository> {
        self
    }
}
