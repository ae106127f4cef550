// Business automations built on the engine

//! # Automation Modules
//!
//! Each module is one business automation. A module can take part in two ways:
//!
//! - **Synchronously**, through [`AutomationModule::before_commit_finalize`],
//!   which runs while a record change is being committed. Returning an error
//!   vetoes the commit; the error's message is what the user sees.
//! - **Asynchronously**, by enqueuing a directive from the hook and handling it
//!   later in a [`TaskProcessor`] returned from [`AutomationModule::processors`].
//!
//! | module | hook | processor |
//! |---|---|---|
//! | `ensure_prerequisites` | veto on failed count condition | - |
//! | `migrate_contracts` | enqueue migration | `MigrateContracts` (Unsafe) |
//! | `upload_to_finance` | enqueue upload | `UploadToFinance` (Full) |
//! | `import_gists` | - | `ImportGists` (Full, recurring) |
//! | `generate_documents` | copy templates | - |
//! | `shared_links` | create link, notify | - |
//!
//! Modules read their configuration from the snapshot in the context or job
//! they are handed and never keep it between invocations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::AutomationConfig;
use crate::engine::job::FollowUp;
use crate::engine::{
    ConditionMatcher, Repository, TaskProcessor, TaskQueue, TriggerEvaluator, DEFAULT_QUEUE_ID,
};
use crate::models::{Record, TaskDirective, UserId};
use crate::{AutomationError, Result};

/// Synchronous prerequisite checks on commit
pub mod ensure_prerequisites;

/// Contract-owner migration when an employee leaves
pub mod migrate_contracts;

/// Invoice export to the finance system
pub mod upload_to_finance;

/// Scheduled import of gists from an external feed
pub mod import_gists;

/// Document generation from templates on demand
pub mod generate_documents;

/// Shared link issuance on workflow state entry
pub mod shared_links;

/// A business automation
#[async_trait]
pub trait AutomationModule: Send + Sync {
    fn name(&self) -> &str;

    /// Runs before a record change is committed; an error vetoes the change
    async fn before_commit_finalize(&self, _ctx: &mut CommitContext) -> Result<()> {
        Ok(())
    }

    /// Task processors this module contributes to the queue
    fn processors(self: Arc<Self>) -> Vec<Arc<dyn TaskProcessor>> {
        Vec::new()
    }
}

/// State of one commit as seen by the module hooks
///
/// `record` is the version being committed and may be changed by hooks;
/// `previous` is the last committed version, if any. The repository handle is
/// the commit's transaction, so records created by a hook disappear again if a
/// later hook vetoes.
pub struct CommitContext {
    pub record: Record,
    pub previous: Option<Record>,
    pub user: UserId,
    pub repository: Arc<dyn Repository>,
    pub config: Arc<AutomationConfig>,
    queue: Arc<TaskQueue>,
    pending: Vec<FollowUp>,
}

impl CommitContext {
    pub fn new(
        record: Record,
        previous: Option<Record>,
        user: UserId,
        repository: Arc<dyn Repository>,
        config: Arc<AutomationConfig>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            record,
            previous,
            user,
            repository,
            config,
            queue,
            pending: Vec::new(),
        }
    }

    pub fn matcher(&self) -> ConditionMatcher {
        ConditionMatcher::new(self.repository.clone())
    }

    pub fn evaluator(&self) -> TriggerEvaluator {
        TriggerEvaluator::new(self.matcher())
    }

    /// True if the record changed workflow state in this commit
    pub fn is_entering_state(&self) -> bool {
        match (&self.previous, self.record.state) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(previous), state) => previous.state != state,
        }
    }

    /// Queue a directive once the commit succeeds
    ///
    /// ## Errors
    /// - `Configuration` if no processor is registered for the task type
    pub fn enqueue<D: TaskDirective>(&mut self, task_type: &str, directive: &D) -> Result<()> {
        if !self.queue.is_registered(DEFAULT_QUEUE_ID, task_type) {
            return Err(AutomationError::Configuration(format!(
                "no processor registered for task type '{}'",
                task_type
            )));
        }
        self.pending.push(FollowUp {
            queue_id: DEFAULT_QUEUE_ID.to_string(),
            task_type: task_type.to_string(),
            directive: serde_json::to_value(directive)?,
            display_name: directive.display_name().map(str::to_string),
            delay: Duration::ZERO,
        });
        Ok(())
    }

    pub(crate) fn take_pending(&mut self) -> Vec<FollowUp> {
        std::mem::take(&mut self.pending)
    }
}
