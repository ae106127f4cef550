// Repository boundary consumed by the engine

//! # Repository Abstraction
//!
//! The document repository itself (object storage, versioning, schema, search
//! execution) lives outside this crate. The engine consumes it through the
//! [`Repository`] trait, which covers exactly what matching, bulk iteration and
//! per-item mutation need.
//!
//! ## Locking
//!
//! Mutations go through an exclusive edit lock: [`Repository::lock`] hands out
//! a [`LockHandle`], [`Repository::save_properties`] requires it and
//! [`Repository::unlock`] releases it. A second `lock` on the same record fails
//! with [`AutomationError::AlreadyLocked`](crate::AutomationError::AlreadyLocked),
//! which is how per-record serialization is enforced without queue-level locks.
//!
//! ## Transactions
//!
//! [`Repository::begin`] opens a unit of work that is itself a repository.
//! Everything done through it is kept on `commit` or undone on `rollback`;
//! locks still held at either point are released. Transactions nest.
//!
//! ## Rust Learning Notes:
//!
//! ### Upcasting Trait Objects
//! `RepositoryTransaction: Repository`, but an `Arc<dyn RepositoryTransaction>`
//! cannot be used where an `Arc<dyn Repository>` is expected without an explicit
//! conversion, so transactions provide [`RepositoryTransaction::as_repository`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    NewRecord, ObjectTypeId, ObjectTypeInfo, PropertyChanges, Record, RecordRef, SearchFilter,
};
use crate::Result;

/// Proof that the caller holds the edit lock on a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub record: RecordRef,
    pub lock_id: Uuid,
    pub holder: String,
}

/// Keyset page request: records strictly after `after`, at most `limit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub after: Option<RecordRef>,
    pub limit: usize,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self { after: None, limit }
    }

    pub fn after(after: RecordRef, limit: usize) -> Self {
        Self {
            after: Some(after),
            limit,
        }
    }
}

/// Request for a shared (public) link to a record's file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedLinkRequest {
    pub record: RecordRef,
    pub file_name: String,
    /// Pin the link to the current version instead of the latest one
    pub version_dependent: bool,
    pub version: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
}

/// A shared link issued by the repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedLink {
    pub access_key: String,
    pub record: RecordRef,
    pub file_name: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
}

/// Operations the engine needs from the document repository
#[async_trait]
pub trait Repository: Send + Sync {
    /// Load the current version of a record; `Ok(None)` if it does not exist
    async fn get_record(&self, record: &RecordRef) -> Result<Option<Record>>;

    async fn object_type(&self, object_type: ObjectTypeId) -> Result<Option<ObjectTypeInfo>>;

    /// One page of records matching `filter`, ordered by reference
    async fn search(&self, filter: &SearchFilter, page: PageRequest) -> Result<Vec<Record>>;

    async fn count(&self, filter: &SearchFilter) -> Result<u64>;

    /// Number of records matching `sub_filter` that reference `record`
    async fn related_count(&self, record: &RecordRef, sub_filter: &SearchFilter) -> Result<u64> {
        let filter = sub_filter.clone().references(*record);
        self.count(&filter).await
    }

    /// Acquire the exclusive edit lock; fails with `AlreadyLocked` if taken
    async fn lock(&self, record: &RecordRef, actor: &str) -> Result<LockHandle>;

    /// Persist property changes on a locked record, returning the new version
    async fn save_properties(&self, handle: &LockHandle, changes: &PropertyChanges) -> Result<Record>;

    async fn unlock(&self, handle: LockHandle) -> Result<()>;

    async fn create_record(&self, record: NewRecord) -> Result<RecordRef>;

    async fn destroy_record(&self, record: &RecordRef) -> Result<()>;

    async fn create_shared_link(&self, request: SharedLinkRequest) -> Result<SharedLink>;

    /// Identifier of the repository, used when building links
    fn vault_id(&self) -> Uuid;

    /// Open a unit of work
    async fn begin(&self) -> Result<Arc<dyn RepositoryTransaction>>;
}

/// A repository view whose changes are kept or discarded together
#[async_trait]
pub trait RepositoryTransaction: Repository {
    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    fn as_repository(self: Arc<Self>) -> Arc<dyn Repository>;
}
