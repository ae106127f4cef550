// Contract-owner migration from a leaving employee to their successor

//! # Migrate Contracts
//!
//! When an employee record is committed in a state matching the configured
//! trigger (typically "has left"), the hook validates the successor and
//! enqueues a [`MigrateContractsDirective`]. The processor then moves every
//! document whose owner property points at the leaving employee over to the
//! successor.
//!
//! ## Resumability
//!
//! The processor runs in `Unsafe` mode: there is no enclosing transaction or
//! timeout, and each document is changed in its own transaction. The working
//! set is a live filter ("owner = person leaving"), so documents that were
//! already migrated stop matching. A redelivery after a crash or shutdown
//! simply continues with what is left.
//!
//! ## Passes
//!
//! After iterating, the filter is counted again. Documents that still match
//! (created mid-run, or locked by someone and handed to a person through an
//! assignment) cause the directive to be enqueued again with `pass + 1` after
//! `requeue_delay_secs`. Once `max_passes` is reached with stragglers left, the
//! entry fails permanently so an operator can look at it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{AutomationModule, CommitContext};
use crate::engine::{
    FallbackAction, ItemMutation, ItemOutcome, ItemTransactionRunner, JobError, JobResult,
    SegmentedIterator, TaskJob, TaskProcessor, DEFAULT_PAGE_SIZE,
};
use crate::models::{
    builtin, ClassId, DirectiveRef, ObjectTypeId, PropertyChanges, PropertyId, PropertyValue,
    Record, RecordRef, SearchFilter, TaskDirective, TransactionMode, Trigger,
};
use crate::{AutomationError, Result};

pub const TASK_TYPE: &str = "MigrateContracts";

/// Log and report progress every this many items
const LOG_EVERY: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateContractsConfig {
    pub enabled: bool,
    /// Employee records matching this trigger start a migration
    pub trigger: Option<Trigger>,
    /// Additional scope for the documents to update
    pub documents_to_update: SearchFilter,
    pub employee_object_type: Option<ObjectTypeId>,
    /// Lookup or multi-lookup property on documents naming their owner
    pub contract_owner_property: Option<PropertyId>,
    /// Lookup property on the employee naming their successor
    pub successor_property: Option<PropertyId>,
    /// Lookup property on the employee naming their user account
    pub user_property: Option<PropertyId>,
    pub page_size: usize,
    pub max_passes: u32,
    pub requeue_delay_secs: u64,
    /// Class of the assignment created for documents that could not be changed
    pub assignment_class: ClassId,
}

impl Default for MigrateContractsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger: None,
            documents_to_update: SearchFilter::default(),
            employee_object_type: None,
            contract_owner_property: None,
            successor_property: None,
            user_property: None,
            page_size: DEFAULT_PAGE_SIZE,
            max_passes: 10,
            requeue_delay_secs: 30,
            assignment_class: builtin::GENERIC_ASSIGNMENT_CLASS,
        }
    }
}

/// Work item: move documents from `person_leaving` to `successor`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrateContractsDirective {
    #[serde(default)]
    pub display_name: Option<String>,
    pub person_leaving: DirectiveRef,
    pub successor: DirectiveRef,
    #[serde(default = "first_pass")]
    pub pass: u32,
}

fn first_pass() -> u32 {
    1
}

impl MigrateContractsDirective {
    pub fn new(person_leaving: &Record, successor: &Record, employee_type: ObjectTypeId) -> Self {
        Self {
            display_name: Some(format!(
                "Migrate documents from {} to {}",
                person_leaving.title, successor.title
            )),
            person_leaving: RecordRef::new(employee_type, person_leaving.reference.id).into(),
            successor: RecordRef::new(employee_type, successor.reference.id).into(),
            pass: first_pass(),
        }
    }

    fn next_pass(&self) -> Self {
        Self {
            pass: self.pass + 1,
            ..self.clone()
        }
    }
}

impl TaskDirective for MigrateContractsDirective {
    fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }
}

/// Points the owner property at the successor
struct OwnerChange {
    property: PropertyId,
    leaving: RecordRef,
    successor: RecordRef,
    comment: String,
}

impl ItemMutation for OwnerChange {
    fn apply(&self, record: &Record) -> Result<PropertyChanges> {
        let value = match record.property(self.property) {
            Some(PropertyValue::Lookup(_)) => PropertyValue::Lookup(self.successor),
            Some(PropertyValue::MultiLookup(owners)) => {
                let mut owners: Vec<RecordRef> = owners
                    .iter()
                    .copied()
                    .filter(|owner| *owner != self.leaving)
                    .collect();
                if !owners.contains(&self.successor) {
                    owners.push(self.successor);
                }
                PropertyValue::MultiLookup(owners)
            }
            other => {
                return Err(AutomationError::Configuration(format!(
                    "Contract owner property {} is not a lookup or multi-lookup (found {})",
                    self.property,
                    other.map(|v| v.to_string()).unwrap_or_else(|| "no value".into())
                )))
            }
        };
        Ok(PropertyChanges::new()
            .set(self.property, value)
            .comment(self.comment.clone()))
    }
}

#[derive(Debug, Default)]
pub struct MigrateContractsModule;

impl MigrateContractsModule {
    pub fn new() -> Self {
        Self
    }

    async fn load(job: &TaskJob, reference: &DirectiveRef, role: &str) -> std::result::Result<Record, JobError> {
        let Some(reference) = reference.record_ref() else {
            error!(directive = %job.entry().directive, "Could not read {} from directive", role);
            return Err(JobError::fatal(format!("Could not load {} from directive", role)));
        };
        match job.repository().get_record(&reference).await? {
            Some(record) => Ok(record),
            None => {
                error!(record = %reference, "Could not load {} from the repository", role);
                Err(AutomationError::RecordNotFound(reference).into())
            }
        }
    }
}

#[async_trait]
impl AutomationModule for MigrateContractsModule {
    fn name(&self) -> &str {
        "Migrate contracts to successor"
    }

    async fn before_commit_finalize(&self, ctx: &mut CommitContext) -> Result<()> {
        let config = ctx.config.migrate_contracts.clone();
        if !config.enabled {
            debug!("Migration of contracts is disabled in configuration; skipping checks");
            return Ok(());
        }

        let Some(trigger) = &config.trigger else {
            return Ok(());
        };
        if !ctx.evaluator().matches_trigger(&ctx.record, trigger).await? {
            debug!(record = %ctx.record.reference, "Record does not match trigger to migrate contracts");
            return Ok(());
        }

        let employee_type = config.employee_object_type.ok_or_else(|| {
            AutomationError::Configuration("Employee object type is not configured.".into())
        })?;
        let successor_property = config.successor_property.ok_or_else(|| {
            AutomationError::Configuration("Successor property is not configured.".into())
        })?;
        let user_property = config.user_property.ok_or_else(|| {
            AutomationError::Configuration("User property is not configured.".into())
        })?;

        let successor_ref = ctx
            .record
            .lookup(successor_property)
            .ok_or_else(|| AutomationError::Validation("Successor is not configured.".into()))?;
        if successor_ref.id == ctx.record.reference.id {
            return Err(AutomationError::Validation(
                "Successor cannot be the person who is leaving.".into(),
            ));
        }
        let successor = ctx
            .repository
            .get_record(&RecordRef::new(employee_type, successor_ref.id))
            .await?
            .ok_or_else(|| AutomationError::Validation("Successor could not be found.".into()))?;
        if successor.lookup(user_property).is_none() {
            return Err(AutomationError::Validation(
                "Successor must have a user account.".into(),
            ));
        }

        let directive = MigrateContractsDirective::new(&ctx.record, &successor, employee_type);
        info!(
            leaving = %ctx.record.title,
            successor = %successor.title,
            "Adding task to migrate documents"
        );
        ctx.enqueue(TASK_TYPE, &directive)
    }

    fn processors(self: Arc<Self>) -> Vec<Arc<dyn TaskProcessor>> {
        vec![self]
    }
}

#[async_trait]
impl TaskProcessor for MigrateContractsModule {
    fn task_type(&self) -> &str {
        TASK_TYPE
    }

    fn transaction_mode(&self) -> TransactionMode {
        TransactionMode::Unsafe
    }

    async fn process(&self, job: &mut TaskJob) -> JobResult {
        let config = job.config().migrate_contracts.clone();
        if !config.enabled {
            info!("Migration of contracts to successor is disabled in configuration; re-queuing task");
            return Err(JobError::requeue("migration of contracts is disabled"));
        }
        let Some(owner_property) = config.contract_owner_property else {
            error!("Contract owner property is not configured");
            return Err(JobError::requeue("contract owner property is not configured"));
        };

        let directive: MigrateContractsDirective = job.directive()?;
        let person_leaving = Self::load(job, &directive.person_leaving, "person leaving").await?;
        let successor = Self::load(job, &directive.successor, "successor").await?;

        let repository = job.repository().clone();
        let filter = config
            .documents_to_update
            .clone()
            .property_equals(owner_property, PropertyValue::Lookup(person_leaving.reference));
        let runner = ItemTransactionRunner::new(repository.clone(), job.config().queue.lock_actor.clone());
        let mutation = OwnerChange {
            property: owner_property,
            leaving: person_leaving.reference,
            successor: successor.reference,
            comment: format!(
                "Owner changed due to {}, as {} was marked as left.",
                successor.title, person_leaving.title
            ),
        };
        let assignees = config
            .user_property
            .and_then(|property| successor.lookup(property))
            .map(|user| vec![user.id])
            .unwrap_or_default();
        let fallback = FallbackAction::CreateAssignment {
            class: config.assignment_class,
            title: format!("Contract could not be assigned to {}", successor.title),
            assignees,
        };

        let mut iterator = SegmentedIterator::new(repository.clone(), filter.clone(), job.signal())
            .with_page_size(config.page_size);
        let mut processed = 0;
        let mut updated = 0;
        while let Some(document) = iterator.next().await? {
            match runner.run(&document, &mutation, &fallback).await? {
                ItemOutcome::Applied(_) => updated += 1,
                ItemOutcome::FellBack { record, reason, .. } => {
                    warn!(record = %record, reason = %reason, "Document handed to successor via assignment")
                }
                ItemOutcome::Missing(_) => {}
            }
            processed += 1;

            if processed % LOG_EVERY == 0 {
                job.report_progress(format!("Updated {}", updated)).await?;
                info!(
                    "Migrated {} documents from {} to {}.",
                    updated, person_leaving.title, successor.title
                );
            }
        }
        job.report_progress(format!("Updated {}", updated)).await?;
        info!(
            pass = directive.pass,
            processed,
            "Migrated {} documents from {} to {}.",
            updated,
            person_leaving.title,
            successor.title
        );

        let remaining = repository.count(&filter).await?;
        if remaining == 0 {
            return Ok(());
        }
        if directive.pass >= config.max_passes {
            return Err(JobError::fatal(format!(
                "{} documents are still owned by {} after {} passes",
                remaining, person_leaving.title, directive.pass
            )));
        }
        info!(remaining, pass = directive.pass, "Documents left to migrate; scheduling another pass");
        job.enqueue_follow_up(
            TASK_TYPE,
            &directive.next_pass(),
            Duration::from_secs(config.requeue_delay_secs),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutomationConfig, ConfigStore};
    use crate::engine::{
        EventBus, InMemoryQueueStore, InMemoryRepository, Repository, TaskOutcome, TaskQueue,
    };
    use crate::models::{EntryState, ObjectTypeInfo, RetryPolicy, SearchCondition};
    use crate::modules::testing;

    const EMPLOYEE_TYPE: ObjectTypeId = 102;
    const OWNER: PropertyId = 1100;
    const SUCCESSOR: PropertyId = 1150;
    const USER: PropertyId = 1160;
    const HAS_LEFT: PropertyId = 1170;

    fn config() -> AutomationConfig {
        let mut config = AutomationConfig::default();
        config.queue.retry = RetryPolicy::immediate(Some(3));
        config.migrate_contracts = MigrateContractsConfig {
            enabled: true,
            trigger: Some(Trigger::default().and(SearchCondition::property(
                HAS_LEFT,
                crate::models::ConditionType::Equal,
                PropertyValue::Boolean(true),
            ))),
            employee_object_type: Some(EMPLOYEE_TYPE),
            contract_owner_property: Some(OWNER),
            successor_property: Some(SUCCESSOR),
            user_property: Some(USER),
            page_size: 2,
            max_passes: 2,
            requeue_delay_secs: 0,
            ..MigrateContractsConfig::default()
        };
        config
    }

    fn employee(id: i64, name: &str) -> Record {
        Record::new(RecordRef::new(EMPLOYEE_TYPE, id), 5, name)
            .with_property(USER, PropertyValue::Lookup(RecordRef::user(id + 40)))
    }

    async fn repository(documents: i64) -> Arc<InMemoryRepository> {
        let repository = Arc::new(InMemoryRepository::new());
        repository
            .register_object_type(ObjectTypeInfo {
                id: 0,
                name: "Document".into(),
                default_property: 1001,
                can_have_files: true,
            })
            .await;
        repository.insert_record(employee(1, "Alice")).await;
        repository.insert_record(employee(2, "Bob")).await;
        let leaving = RecordRef::new(EMPLOYEE_TYPE, 1);
        for id in 1..=documents {
            let owner = if id % 2 == 0 {
                PropertyValue::MultiLookup(vec![RecordRef::new(EMPLOYEE_TYPE, 3), leaving])
            } else {
                PropertyValue::Lookup(leaving)
            };
            repository
                .insert_record(Record::new(RecordRef::new(0, id), 4, format!("Contract {}", id)).with_property(OWNER, owner))
                .await;
        }
        repository
    }

    fn queue(repository: Arc<InMemoryRepository>, config: AutomationConfig) -> Arc<TaskQueue> {
        let queue = Arc::new(TaskQueue::new(
            Arc::new(InMemoryQueueStore::new()),
            repository,
            ConfigStore::new(config),
            EventBus::new(),
        ));
        for processor in Arc::new(MigrateContractsModule::new()).processors() {
            queue.register(processor);
        }
        queue
    }

    fn directive() -> MigrateContractsDirective {
        MigrateContractsDirective::new(&employee(1, "Alice"), &employee(2, "Bob"), EMPLOYEE_TYPE)
    }

    async fn owned_by_alice(repository: &InMemoryRepository) -> u64 {
        repository
            .count(&SearchFilter::new().property_equals(OWNER, PropertyValue::Lookup(RecordRef::new(EMPLOYEE_TYPE, 1))))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_hook_enqueues_directive_for_leaving_employee() {
        let repository = repository(0).await;
        let config = config();
        let queue = queue(repository.clone(), config.clone());
        let leaving = employee(1, "Alice")
            .with_property(HAS_LEFT, PropertyValue::Boolean(true))
            .with_property(SUCCESSOR, PropertyValue::Lookup(RecordRef::new(EMPLOYEE_TYPE, 2)));
        let mut ctx = testing::context(leaving, None, repository, config, queue);

        MigrateContractsModule::new().before_commit_finalize(&mut ctx).await.unwrap();

        let pending = ctx.take_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_type, TASK_TYPE);
        assert_eq!(pending[0].display_name.as_deref(), Some("Migrate documents from Alice to Bob"));
        let decoded: MigrateContractsDirective = serde_json::from_value(pending[0].directive.clone()).unwrap();
        assert_eq!(decoded, directive());
    }

    #[tokio::test]
    async fn test_hook_validates_successor() {
        let repository = repository(0).await;
        repository.insert_record(Record::new(RecordRef::new(EMPLOYEE_TYPE, 9), 5, "No account")).await;
        let config = config();
        let queue = queue(repository.clone(), config.clone());
        let leaving = employee(1, "Alice").with_property(HAS_LEFT, PropertyValue::Boolean(true));

        let cases = vec![
            (None, "Successor is not configured."),
            (Some(1), "Successor cannot be the person who is leaving."),
            (Some(9), "Successor must have a user account."),
        ];
        for (successor, message) in cases {
            let mut record = leaving.clone();
            if let Some(id) = successor {
                record = record.with_property(SUCCESSOR, PropertyValue::Lookup(RecordRef::new(EMPLOYEE_TYPE, id)));
            }
            let mut ctx = testing::context(record, None, repository.clone(), config.clone(), queue.clone());
            let err = MigrateContractsModule::new().before_commit_finalize(&mut ctx).await.unwrap_err();
            assert_eq!(err.to_string(), message);
            assert!(ctx.take_pending().is_empty());
        }
    }

    #[tokio::test]
    async fn test_hook_ignores_employees_who_have_not_left() {
        let repository = repository(0).await;
        let config = config();
        let queue = queue(repository.clone(), config.clone());
        let mut ctx = testing::context(employee(1, "Alice"), None, repository, config, queue);

        MigrateContractsModule::new().before_commit_finalize(&mut ctx).await.unwrap();
        assert!(ctx.take_pending().is_empty());
    }

    #[tokio::test]
    async fn test_migrates_single_and_multi_lookup_owners() {
        let repository = repository(5).await;
        let queue = queue(repository.clone(), config());
        let id = queue.enqueue(crate::engine::DEFAULT_QUEUE_ID, TASK_TYPE, &directive()).await.unwrap();

        let processed = queue.run_until_idle().await.unwrap();
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].outcome, TaskOutcome::Completed);

        let bob = RecordRef::new(EMPLOYEE_TYPE, 2);
        let carol = RecordRef::new(EMPLOYEE_TYPE, 3);
        let single = repository.get_record(&RecordRef::new(0, 1)).await.unwrap().unwrap();
        assert_eq!(single.property(OWNER), Some(&PropertyValue::Lookup(bob)));
        assert_eq!(
            single.version_comment.as_deref(),
            Some("Owner changed due to Bob, as Alice was marked as left.")
        );
        let multi = repository.get_record(&RecordRef::new(0, 2)).await.unwrap().unwrap();
        assert_eq!(multi.property(OWNER), Some(&PropertyValue::MultiLookup(vec![carol, bob])));

        let entry = queue.get(id).await.unwrap().unwrap();
        assert_eq!(entry.progress.as_deref(), Some("Updated 5"));
        assert_eq!(owned_by_alice(&repository).await, 0);
    }

    #[tokio::test]
    async fn test_progress_is_reported_in_batches() {
        let repository = repository(45).await;
        let mut config = config();
        config.migrate_contracts.page_size = 100;
        let queue = queue(repository.clone(), config);
        let mut events = queue.events().subscribe();
        queue.enqueue(crate::engine::DEFAULT_QUEUE_ID, TASK_TYPE, &directive()).await.unwrap();

        let processed = queue.run_until_idle().await.unwrap();
        assert_eq!(processed[0].outcome, TaskOutcome::Completed);

        let mut reported = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let crate::engine::QueueEventKind::Progress { details } = event.kind {
                reported.push(details);
            }
        }
        assert_eq!(reported, vec!["Updated 20", "Updated 40", "Updated 45"]);
    }

    #[tokio::test]
    async fn test_locked_document_gets_an_assignment_and_another_pass() {
        let repository = repository(3).await;
        let queue = queue(repository.clone(), config());
        let _held = repository.lock(&RecordRef::new(0, 2), "editor").await.unwrap();
        queue.enqueue(crate::engine::DEFAULT_QUEUE_ID, TASK_TYPE, &directive()).await.unwrap();

        let first = queue.run_next().await.unwrap().unwrap();
        assert_eq!(first.outcome, TaskOutcome::Completed);
        assert_eq!(owned_by_alice(&repository).await, 1);

        let assignments = repository
            .search(
                &SearchFilter::new().object_type(builtin::ASSIGNMENT_OBJECT_TYPE),
                crate::engine::PageRequest::first(10),
            )
            .await
            .unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].title, "Contract could not be assigned to Bob");
        assert_eq!(
            assignments[0].property(builtin::ASSIGNED_TO_PROPERTY),
            Some(&PropertyValue::MultiLookup(vec![RecordRef::user(42)]))
        );

        // Second pass still finds the locked document, reuses the assignment and gives up.
        let second = queue.run_next().await.unwrap().unwrap();
        assert!(matches!(second.outcome, TaskOutcome::Failed { .. }));
        let entries = queue.list().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].state, EntryState::Failed);
        assert!(entries[1].last_error.as_deref().unwrap().contains("after 2 passes"));
        assert_eq!(repository.count(&SearchFilter::new().object_type(builtin::ASSIGNMENT_OBJECT_TYPE)).await.unwrap(), 1);
        assert!(queue.run_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nothing_to_migrate_is_a_no_op() {
        let repository = repository(0).await;
        let queue = queue(repository.clone(), config());
        let id = queue.enqueue(crate::engine::DEFAULT_QUEUE_ID, TASK_TYPE, &directive()).await.unwrap();

        let processed = queue.run_until_idle().await.unwrap();
        assert_eq!(processed.len(), 1);
        assert_eq!(queue.list().await.unwrap().len(), 1);
        assert_eq!(queue.get(id).await.unwrap().unwrap().state, EntryState::Done);
    }

    #[tokio::test]
    async fn test_disabled_requeues() {
        let repository = repository(1).await;
        let mut config = config();
        config.migrate_contracts.enabled = false;
        let queue = queue(repository.clone(), config);
        queue.enqueue(crate::engine::DEFAULT_QUEUE_ID, TASK_TYPE, &directive()).await.unwrap();

        let processed = queue.run_next().await.unwrap().unwrap();
        assert!(matches!(processed.outcome, TaskOutcome::Requeued { .. }));
        assert_eq!(owned_by_alice(&repository).await, 1);
    }

    #[tokio::test]
    async fn test_unresolvable_directive_is_fatal() {
        let repository = repository(1).await;
        let queue = queue(repository.clone(), config());
        let mut broken = directive();
        broken.successor = DirectiveRef::default();
        queue.enqueue(crate::engine::DEFAULT_QUEUE_ID, TASK_TYPE, &broken).await.unwrap();

        let processed = queue.run_until_idle().await.unwrap();
        assert_eq!(processed.len(), 1);
        assert!(matches!(&processed[0].outcome, TaskOutcome::Failed { message } if message.contains("successor")));
    }

    #[test]
    fn test_owner_change_rejects_non_lookup_property() {
        let change = OwnerChange {
            property: OWNER,
            leaving: RecordRef::new(EMPLOYEE_TYPE, 1),
            successor: RecordRef::new(EMPLOYEE_TYPE, 2),
            comment: String::new(),
        };
        let record = Record::new(RecordRef::new(0, 1), 4, "Contract")
            .with_property(OWNER, PropertyValue::Text("Alice".into()));
        assert!(change.apply(&record).unwrap_err().is_configuration());
    }
}
