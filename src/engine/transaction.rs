// Per-item transactional mutation with conflict fallback

//! # Per-Item Transaction Runner
//!
//! [`ItemTransactionRunner::run`] changes one record in its own unit of work:
//!
//! 1. open a transaction and take the record's edit lock
//! 2. re-read the record and let the [`ItemMutation`] compute the changes
//! 3. save, release the lock and commit
//!
//! The lock is released on every path, including failures, and a failed
//! attempt is rolled back as a whole.
//!
//! When the lock cannot be taken or the change cannot be saved (typically
//! because someone else is editing the record), the runner does not fail the
//! batch. It runs the configured [`FallbackAction`] instead, for example
//! creating an assignment that asks a person to finish the change, and reports
//! [`ItemOutcome::FellBack`]. Configuration errors and cancellation are the
//! exceptions: they stop the batch.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::repository::{PageRequest, Repository, RepositoryTransaction};
use crate::models::{
    builtin, ClassId, NewRecord, PropertyChanges, PropertyValue, Record, RecordRef, SearchFilter,
    UserId,
};
use crate::{AutomationError, Result};

/// Computes the changes to apply to the freshly locked record
pub trait ItemMutation: Send + Sync {
    fn apply(&self, record: &Record) -> Result<PropertyChanges>;
}

impl<F> ItemMutation for F
where
    F: Fn(&Record) -> Result<PropertyChanges> + Send + Sync,
{
    fn apply(&self, record: &Record) -> Result<PropertyChanges> {
        self(record)
    }
}

/// What to do when an item cannot be changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FallbackAction {
    /// Create an assignment referencing the record so a person can finish the change
    CreateAssignment {
        class: ClassId,
        title: String,
        #[serde(default)]
        assignees: Vec<UserId>,
    },
    /// Log and move on
    Skip,
}

/// Result of running one item
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Applied(Record),
    FellBack {
        record: RecordRef,
        reason: String,
        /// Record created by the fallback, if any
        created: Option<RecordRef>,
    },
    /// The record disappeared before it could be changed
    Missing(RecordRef),
}

impl ItemOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ItemOutcome::Applied(_))
    }
}

/// Runs per-record mutations, one transaction each
#[derive(Clone)]
pub struct ItemTransactionRunner {
    repository: Arc<dyn Repository>,
    actor: String,
}

impl ItemTransactionRunner {
    pub fn new(repository: Arc<dyn Repository>, actor: impl Into<String>) -> Self {
        Self {
            repository,
            actor: actor.into(),
        }
    }

    /// Apply `mutation` to `record`, falling back on contention
    ///
    /// ## Errors
    /// - Configuration errors from the mutation or the fallback
    /// - `Cancelled` / `Aborted`
    /// - Repository failures while running the fallback itself
    pub async fn run<M: ItemMutation + ?Sized>(
        &self,
        record: &Record,
        mutation: &M,
        fallback: &FallbackAction,
    ) -> Result<ItemOutcome> {
        let reference = record.reference;
        let transaction = self.repository.begin().await?;

        match self.apply(transaction.as_ref(), reference, mutation).await {
            Ok(updated) => {
                transaction.commit().await?;
                debug!(record = %reference, version = updated.version, "Applied item change");
                Ok(ItemOutcome::Applied(updated))
            }
            Err(error) => {
                transaction.rollback().await?;
                match error {
                    AutomationError::RecordNotFound(_) => {
                        warn!(record = %reference, "Record vanished before it could be changed");
                        Ok(ItemOutcome::Missing(reference))
                    }
                    AutomationError::Cancelled | AutomationError::Aborted => Err(error),
                    error if error.is_configuration() => Err(error),
                    error => {
                        warn!(
                            record = %reference,
                            error = %error,
                            "Could not change record, running fallback action"
                        );
                        let created = self.run_fallback(record, fallback).await?;
                        Ok(ItemOutcome::FellBack {
                            record: reference,
                            reason: error.to_string(),
                            created,
                        })
                    }
                }
            }
        }
    }

    async fn apply<M: ItemMutation + ?Sized>(
        &self,
        repository: &dyn RepositoryTransaction,
        reference: RecordRef,
        mutation: &M,
    ) -> Result<Record> {
        let handle = repository.lock(&reference, &self.actor).await?;

        let result = async {
            let current = repository
                .get_record(&reference)
                .await?
                .ok_or(AutomationError::RecordNotFound(reference))?;
            let changes = mutation.apply(&current)?;
            repository.save_properties(&handle, &changes).await
        }
        .await;

        let released = repository.unlock(handle).await;
        let updated = result?;
        released?;
        Ok(updated)
    }

    async fn run_fallback(&self, record: &Record, fallback: &FallbackAction) -> Result<Option<RecordRef>> {
        match fallback {
            FallbackAction::Skip => Ok(None),
            FallbackAction::CreateAssignment {
                class,
                title,
                assignees,
            } => {
                let transaction = self.repository.begin().await?;
                match self
                    .create_assignment(transaction.as_ref(), record, *class, title, assignees)
                    .await
                {
                    Ok(created) => {
                        transaction.commit().await?;
                        Ok(created)
                    }
                    Err(e) => {
                        transaction.rollback().await?;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Create the follow-up assignment unless an identical one already exists
    async fn create_assignment(
        &self,
        repository: &dyn RepositoryTransaction,
        record: &Record,
        class: ClassId,
        title: &str,
        assignees: &[UserId],
    ) -> Result<Option<RecordRef>> {
        let object_type = repository
            .object_type(record.reference.object_type)
            .await?
            .ok_or_else(|| {
                AutomationError::Configuration(format!(
                    "object type {} is not known, cannot reference {} from an assignment",
                    record.reference.object_type, record.reference
                ))
            })?;

        let existing = SearchFilter::new()
            .object_type(builtin::ASSIGNMENT_OBJECT_TYPE)
            .class(class)
            .references(record.reference);
        let duplicates = repository.search(&existing, PageRequest::first(50)).await?;
        if let Some(duplicate) = duplicates.iter().find(|a| a.title == title) {
            debug!(record = %record.reference, assignment = %duplicate.reference, "Assignment already exists");
            return Ok(Some(duplicate.reference));
        }

        let users = assignees.iter().map(|id| RecordRef::user(*id)).collect();
        let assignment = NewRecord::new(builtin::ASSIGNMENT_OBJECT_TYPE, class, title)
            .with_property(
                object_type.default_property,
                PropertyValue::MultiLookup(vec![record.reference]),
            )
            .with_property(builtin::ASSIGNED_TO_PROPERTY, PropertyValue::MultiLookup(users));
        let created = repository.create_record(assignment).await?;
        warn!(record = %record.reference, assignment = %created, "Created follow-up assignment");
        Ok(Some(created))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryRepository;
    use crate::models::ObjectTypeInfo;

    const TITLE: i32 = 1300;

    async fn repository() -> Arc<InMemoryRepository> {
        let repository = Arc::new(InMemoryRepository::new());
        repository
            .register_object_type(ObjectTypeInfo {
                id: 0,
                name: "Document".into(),
                default_property: 1001,
                can_have_files: true,
            })
            .await;
        for id in 1..=3 {
            repository
                .insert_record(Record::new(RecordRef::new(0, id), 1, format!("Doc {}", id)))
                .await;
        }
        repository
    }

    fn set_flag(_: &Record) -> Result<PropertyChanges> {
        Ok(PropertyChanges::new()
            .set(TITLE, PropertyValue::Text("migrated".into()))
            .comment("migrated by test"))
    }

    fn assignment() -> FallbackAction {
        FallbackAction::CreateAssignment {
            class: builtin::GENERIC_ASSIGNMENT_CLASS,
            title: "Finish the change".into(),
            assignees: vec![7],
        }
    }

    #[tokio::test]
    async fn test_applies_and_releases_lock() {
        let repository = repository().await;
        let runner = ItemTransactionRunner::new(repository.clone(), "worker");
        let record = repository.get_record(&RecordRef::new(0, 1)).await.unwrap().unwrap();

        let outcome = runner.run(&record, &set_flag, &assignment()).await.unwrap();

        match outcome {
            ItemOutcome::Applied(updated) => {
                assert_eq!(updated.version, 2);
                assert_eq!(updated.version_comment.as_deref(), Some("migrated by test"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(repository.lock_holder(&record.reference).await.is_none());
    }

    #[tokio::test]
    async fn test_locked_record_creates_one_assignment() {
        let repository = repository().await;
        let runner = ItemTransactionRunner::new(repository.clone(), "worker");
        let record = repository.get_record(&RecordRef::new(0, 2)).await.unwrap().unwrap();
        let _held = repository.lock(&record.reference, "alice").await.unwrap();

        let first = runner.run(&record, &set_flag, &assignment()).await.unwrap();
        let second = runner.run(&record, &set_flag, &assignment()).await.unwrap();

        let created = match (&first, &second) {
            (
                ItemOutcome::FellBack { created: Some(a), reason, .. },
                ItemOutcome::FellBack { created: Some(b), .. },
            ) => {
                assert!(reason.contains("alice"));
                assert_eq!(a, b);
                *a
            }
            other => panic!("unexpected outcomes {:?}", other),
        };

        let assignment = repository.get_record(&created).await.unwrap().unwrap();
        assert_eq!(assignment.reference.object_type, builtin::ASSIGNMENT_OBJECT_TYPE);
        assert_eq!(assignment.title, "Finish the change");
        assert!(assignment.references(&record.reference));
        assert_eq!(
            assignment.property(builtin::ASSIGNED_TO_PROPERTY),
            Some(&PropertyValue::MultiLookup(vec![RecordRef::user(7)]))
        );
        assert_eq!(repository.lock_holder(&record.reference).await.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_record_untouched_and_unlocked() {
        let repository = repository().await;
        let runner = ItemTransactionRunner::new(repository.clone(), "worker");
        let record = repository.get_record(&RecordRef::new(0, 3)).await.unwrap().unwrap();
        let conflicting = |_: &Record| -> Result<PropertyChanges> {
            Err(AutomationError::Conflict("concurrent edit".into()))
        };

        let outcome = runner.run(&record, &conflicting, &FallbackAction::Skip).await.unwrap();

        assert!(matches!(outcome, ItemOutcome::FellBack { created: None, .. }));
        let reloaded = repository.get_record(&record.reference).await.unwrap().unwrap();
        assert_eq!(reloaded.version, 1);
        assert!(reloaded.checked_out_to.is_none());
    }

    #[tokio::test]
    async fn test_configuration_error_stops_the_batch() {
        let repository = repository().await;
        let runner = ItemTransactionRunner::new(repository.clone(), "worker");
        let record = repository.get_record(&RecordRef::new(0, 1)).await.unwrap().unwrap();
        let misconfigured = |_: &Record| -> Result<PropertyChanges> {
            Err(AutomationError::Configuration("owner property has the wrong datatype".into()))
        };

        let err = runner.run(&record, &misconfigured, &assignment()).await.unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(repository.records().await.len(), 3);
        assert!(repository.lock_holder(&record.reference).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_record_is_reported() {
        let repository = repository().await;
        let runner = ItemTransactionRunner::new(repository.clone(), "worker");
        let record = repository.get_record(&RecordRef::new(0, 1)).await.unwrap().unwrap();
        repository.destroy_record(&record.reference).await.unwrap();

        let outcome = runner.run(&record, &set_flag, &assignment()).await.unwrap();
        assert_eq!(outcome, ItemOutcome::Missing(record.reference));
    }
}
