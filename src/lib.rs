// Vault Automation - Rust Edition
// Rule-triggered task processing for document repositories

//! # Vault Automation Library
//!
//! This is the library root for Vault Automation, an engine that watches record
//! state changes in a document repository, decides which automation rules apply,
//! and processes the resulting work asynchronously through a durable task queue.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`Record`] / [`RecordRef`]: A repository object and its durable identifier
//! - [`SearchFilter`]: Structured query evaluated against record properties
//! - [`Condition`] / [`Trigger`] / [`Rule`]: Declarative OR-of-ANDs matching
//! - [`QueueEntry`]: A persisted task directive plus its delivery state
//!
//! ### Matching
//!
//! #### [`ConditionMatcher`] - Read-only Predicate Evaluation
//!
//! Evaluates property conditions against the loaded record and count conditions
//! against the repository ("how many records reference this one?").
//!
//! #### [`TriggerEvaluator`] - Rule Selection
//!
//! Returns every rule with at least one fully satisfied trigger, in configuration
//! order. All matching rules run; there is no first-match-wins.
//!
//! ### Task Processing
//!
//! - [`TaskQueue`]: Enqueue, dispatch, progress, cancellation and retry policy
//! - [`SegmentedIterator`]: Paged streaming over very large working sets
//! - [`ItemTransactionRunner`]: Lock, mutate, save, unlock, or fall back
//!
//! ### Modules
//! Business automations (contract migration, finance upload, gist import,
//! prerequisite checks, document generation, shared links) live in [`modules`]
//! and are wired together by [`AutomationApp`].
//!
//! ## Rust Learning Notes:
//!
//! ### Error Handling
//! Every fallible operation returns [`Result<T>`], an alias over
//! [`AutomationError`]. The `?` operator converts library errors (`serde_json`,
//! `std::io`, `anyhow`) through the `#[from]` attributes generated by `thiserror`.
//!
//! ### Trait Objects at the Seams
//! The repository, queue store, finance uploader and gist feed are all traits used
//! as `Arc<dyn Trait>`, so the engine can run against the in-memory backends in
//! tests and against real backends in production.

// Declares the `models` module from `models/mod.rs`
// Contains records, search filters, conditions, directives and queue entries
pub mod models;

// Declares the `engine` module from `engine/mod.rs`
// Contains the repository boundary, matcher, queue, iterator and item runner
pub mod engine;

// Declares the `modules` module from `modules/mod.rs`
// Contains the business automations built on top of the engine
pub mod modules;

// Application wiring and lifecycle
pub mod app;

// Configuration snapshot loading
pub mod config;

// Tracing subscriber setup
pub mod logging;

// Re-export commonly used types for convenience
pub use app::{AutomationApp, AutomationAppBuilder};
pub use config::{AutomationConfig, ConfigStore};
pub use engine::{
    ConditionMatcher, InMemoryRepository, ItemTransactionRunner, Repository, SegmentedIterator,
    TaskQueue, TriggerEvaluator,
};
pub use models::{
    Condition, QueueEntry, Record, RecordRef, Rule, SearchFilter, TransactionMode, Trigger,
};

/// Error types for the automation engine
///
/// Each variant maps onto one class of the error taxonomy: configuration
/// problems, transient contention, unsalvageable directives and user-facing
/// validation vetoes. Queue processing turns these into retry decisions
/// through [`engine::job::JobError`].
#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    #[error("Record not found: {0}")]
    RecordNotFound(RecordRef),

    #[error("Record {record} is locked by {holder}")]
    AlreadyLocked { record: RecordRef, holder: String },

    #[error("Record {0} is not locked by this handle")]
    NotLocked(RecordRef),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A synchronous veto whose message is shown to the user as-is
    #[error("{0}")]
    Validation(String),

    #[error("A rule is configured that uses the condition type of {0}, but this is not supported for numerical comparisons.")]
    UnsupportedComparator(String),

    #[error("Malformed task directive: {0}")]
    MalformedDirective(String),

    #[error("Task was cancelled")]
    Cancelled,

    #[error("Task processing was aborted")]
    Aborted,

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Conflicting change: {0}")]
    Conflict(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AutomationError {
    /// True for errors caused by configuration rather than data or contention
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AutomationError::Configuration(_) | AutomationError::UnsupportedComparator(_)
        )
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AutomationError>;
