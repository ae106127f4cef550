// Vault Automation Engine
// Matching, queueing and bulk processing on top of the repository boundary

//! # Engine Module
//!
//! The engine sits between the domain models and the business automations in
//! [`crate::modules`]. It owns everything that is independent of a particular
//! automation: how conditions are matched, how work is queued and delivered,
//! and how large working sets are processed safely.
//!
//! ## Engine Components
//!
//! ### Repository Boundary (`repository`, `storage`)
//! - [`Repository`] trait consumed by every other component
//! - [`InMemoryRepository`] with locks and undo-journal transactions
//!
//! ### Matching (`matcher`, `triggers`)
//! - Property and related-count conditions
//! - OR-of-ANDs trigger evaluation over any [`Triggered`](crate::models::Triggered) rule
//!
//! ### Task Processing (`job`, `queue_store`, `queue`, `events`)
//! - Typed processors registered per (queue, task type)
//! - Durable entries with retry policy, cancellation and recurrence
//! - Broadcast of queue events for observers
//!
//! ### Bulk Work (`bulk`, `transaction`)
//! - Paged, cancellable iteration over search results
//! - One transaction per item, with a fallback when an item is contended
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports for API Design
//! The `pub use` statements flatten the hierarchy, so callers write
//! `engine::TaskQueue` rather than `engine::queue::TaskQueue`.

/// Repository trait, lock handles, paging and transactions
pub mod repository;

/// In-memory repository used by tests, demos and the worker's seed mode
pub mod storage;

/// Condition evaluation against a record and the repository
pub mod matcher;

/// Rule selection by triggers
pub mod triggers;

/// Queue event broadcasting
pub mod events;

/// Task processors, job context and failure classification
pub mod job;

/// Persistence of queue entries
pub mod queue_store;

/// Task queue and background workers
pub mod queue;

/// Segmented iteration over large result sets
pub mod bulk;

/// Per-item transactions with fallback
pub mod transaction;

pub use bulk::{SegmentedIterator, DEFAULT_PAGE_SIZE};
pub use events::{EventBus, QueueEvent, QueueEventKind};
pub use job::{CancellationSignal, FailureClass, JobError, JobResult, TaskJob, TaskProcessor};
pub use matcher::ConditionMatcher;
pub use queue::{ProcessedEntry, QueueRunner, TaskOutcome, TaskQueue, DEFAULT_QUEUE_ID};
pub use queue_store::{FileQueueStore, InMemoryQueueStore, QueueStore};
pub use repository::{
    LockHandle, PageRequest, Repository, RepositoryTransaction, SharedLink, SharedLinkRequest,
};
pub use storage::{InMemoryRepository, InMemoryTransaction, RepositorySeed};
pub use transaction::{FallbackAction, ItemMutation, ItemOutcome, ItemTransactionRunner};
pub use triggers::TriggerEvaluator;
