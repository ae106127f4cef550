// Core domain models for Vault Automation
// Records, queries, rules and queued work

//! # Domain Models Module
//!
//! This module contains the data structures shared by the engine and the
//! automation modules. They are plain serde types: configuration deserializes
//! into them, the queue persists them, and the repository boundary speaks them.
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements at the bottom create a flat API, so callers can
//! write `use vault_automation::models::Record` instead of
//! `use vault_automation::models::record::Record`.

// Declares the `record` submodule from `record.rs`
// Contains Record, RecordRef, PropertyValue and PropertyChanges
pub mod record;

// Declares the `search` submodule from `search.rs`
// Contains SearchFilter, SearchCondition and the ConditionType operators
pub mod search;

// Declares the `condition` submodule from `condition.rs`
// Contains Condition and CountCondition
pub mod condition;

// Declares the `rule` submodule from `rule.rs`
// Contains Trigger and the generic Rule
pub mod rule;

// Declares the `directive` submodule from `directive.rs`
// Contains the TaskDirective trait and shared directive payloads
pub mod directive;

// Declares the `queue_entry` submodule from `queue_entry.rs`
// Contains QueueEntry, delivery states and the retry policy
pub mod queue_entry;

pub use condition::{Condition, CountCondition};
pub use directive::{DirectiveRef, EmptyDirective, ObjectDirective, TaskDirective};
pub use queue_entry::{BackoffStrategy, EntryState, QueueEntry, RetryPolicy, TransactionMode};
pub use record::{
    builtin, ClassId, NewRecord, ObjectTypeId, ObjectTypeInfo, PropertyChanges, PropertyId,
    PropertyValue, Record, RecordFile, RecordRef, StateId, UserId,
};
pub use rule::{Rule, Trigger, Triggered};
pub use search::{ConditionType, Expression, SearchCondition, SearchFilter};
