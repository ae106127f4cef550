// Task processors and the per-delivery job context

//! # Jobs and Processors
//!
//! A [`TaskProcessor`] handles one task type. For every delivery the queue
//! builds a [`TaskJob`] holding the entry, the repository view the handler must
//! use (a transaction in `Full` mode), a configuration snapshot and the
//! cancellation signals.
//!
//! Processors return [`JobResult`]. Any [`AutomationError`] converts into a
//! [`JobError`] through `?`, which classifies it:
//!
//! | error | class |
//! |---|---|
//! | record not found, malformed directive, serialization, validation, configuration, unsupported comparator | `Fatal` |
//! | locked, conflict, timeout, abort, storage, io, queue | `Requeue` |
//! | cancelled | `Cancelled` |
//!
//! Handlers that want a different outcome construct the `JobError` directly,
//! e.g. [`JobError::requeue`] for "not configured yet".

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::events::{EventBus, QueueEventKind};
use super::queue_store::QueueStore;
use super::repository::Repository;
use crate::config::AutomationConfig;
use crate::models::{QueueEntry, TaskDirective, TransactionMode};
use crate::{AutomationError, Result};

/// How the queue should treat a failed delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Deliver again later
    Requeue,
    /// Mark failed permanently and surface to operators
    Fatal,
    /// Stop without retrying because an operator cancelled the entry
    Cancelled,
    /// Interrupted by worker shutdown; delivered again without using up an attempt
    Aborted,
}

/// Classified processor failure
#[derive(Debug, Clone, PartialEq)]
pub struct JobError {
    pub class: FailureClass,
    pub message: String,
}

impl JobError {
    pub fn requeue(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Requeue,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Fatal,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            class: FailureClass::Cancelled,
            message: "cancelled by operator".into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.class, self.message)
    }
}

impl From<AutomationError> for JobError {
    fn from(error: AutomationError) -> Self {
        let class = match &error {
            AutomationError::Cancelled => FailureClass::Cancelled,
            AutomationError::Aborted => FailureClass::Aborted,
            AutomationError::RecordNotFound(_)
            | AutomationError::MalformedDirective(_)
            | AutomationError::Serialization(_)
            | AutomationError::Validation(_)
            | AutomationError::Configuration(_)
            | AutomationError::UnsupportedComparator(_) => FailureClass::Fatal,
            AutomationError::AlreadyLocked { .. }
            | AutomationError::NotLocked(_)
            | AutomationError::Conflict(_)
            | AutomationError::Timeout(_)
            | AutomationError::Queue(_)
            | AutomationError::Storage(_)
            | AutomationError::Io(_) => FailureClass::Requeue,
        };
        Self {
            class,
            message: error.to_string(),
        }
    }
}

pub type JobResult = std::result::Result<(), JobError>;

/// Handler for one task type
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    fn queue_id(&self) -> &str {
        super::DEFAULT_QUEUE_ID
    }

    fn task_type(&self) -> &str;

    fn transaction_mode(&self) -> TransactionMode;

    async fn process(&self, job: &mut TaskJob) -> JobResult;
}

/// Operator cancellation plus worker shutdown, checked between steps
#[derive(Clone, Default)]
pub struct CancellationSignal {
    cancel: CancellationToken,
    abort: CancellationToken,
}

impl CancellationSignal {
    pub fn new(cancel: CancellationToken, abort: CancellationToken) -> Self {
        Self { cancel, abort }
    }

    /// Signal that never fires
    pub fn none() -> Self {
        Self::default()
    }

    /// `Cancelled` if an operator cancelled the entry, `Aborted` on shutdown
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AutomationError::Cancelled);
        }
        if self.abort.is_cancelled() {
            return Err(AutomationError::Aborted);
        }
        Ok(())
    }
}

/// Work queued by a handler, applied only after it succeeds
#[derive(Debug, Clone)]
pub struct FollowUp {
    pub queue_id: String,
    pub task_type: String,
    pub directive: serde_json::Value,
    pub display_name: Option<String>,
    pub delay: Duration,
}

/// Context of one delivery of a queue entry
pub struct TaskJob {
    entry: QueueEntry,
    repository: Arc<dyn Repository>,
    config: Arc<AutomationConfig>,
    signal: CancellationSignal,
    store: Arc<dyn QueueStore>,
    events: EventBus,
    follow_ups: Vec<FollowUp>,
}

impl TaskJob {
    pub fn new(
        entry: QueueEntry,
        repository: Arc<dyn Repository>,
        config: Arc<AutomationConfig>,
        signal: CancellationSignal,
        store: Arc<dyn QueueStore>,
        events: EventBus,
    ) -> Self {
        Self {
            entry,
            repository,
            config,
            signal,
            store,
            events,
            follow_ups: Vec::new(),
        }
    }

    pub fn entry(&self) -> &QueueEntry {
        &self.entry
    }

    /// Repository view for this delivery (a transaction in `Full` mode)
    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn config(&self) -> &AutomationConfig {
        &self.config
    }

    /// Decode the directive payload; a payload that does not fit is `MalformedDirective`
    pub fn directive<D: TaskDirective>(&self) -> Result<D> {
        serde_json::from_value(self.entry.directive.clone())
            .map_err(|e| AutomationError::MalformedDirective(e.to_string()))
    }

    pub fn signal(&self) -> CancellationSignal {
        self.signal.clone()
    }

    pub fn throw_if_cancelled(&self) -> Result<()> {
        self.signal.check()
    }

    /// Record human readable progress on the entry
    pub async fn report_progress(&self, details: impl Into<String>) -> Result<()> {
        let details = details.into();
        self.store.set_progress(self.entry.id, &details).await?;
        self.events.emit(
            self.entry.id,
            &self.entry.task_type,
            self.entry.display_name.as_deref(),
            QueueEventKind::Progress { details },
        );
        Ok(())
    }

    /// Queue another task once this one completes successfully
    pub fn enqueue_follow_up<D: TaskDirective>(
        &mut self,
        task_type: &str,
        directive: &D,
        delay: Duration,
    ) -> Result<()> {
        self.follow_ups.push(FollowUp {
            queue_id: self.entry.queue_id.clone(),
            task_type: task_type.to_string(),
            directive: serde_json::to_value(directive)?,
            display_name: directive.display_name().map(str::to_string),
            delay,
        });
        Ok(())
    }

    pub(crate) fn take_follow_ups(&mut self) -> Vec<FollowUp> {
        std::mem::take(&mut self.follow_ups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordRef;

    #[test]
    fn test_classification_of_repository_errors() {
        let missing: JobError = AutomationError::RecordNotFound(RecordRef::new(0, 1)).into();
        assert_eq!(missing.class, FailureClass::Fatal);

        let locked: JobError = AutomationError::AlreadyLocked {
            record: RecordRef::new(0, 1),
            holder: "bob".into(),
        }
        .into();
        assert_eq!(locked.class, FailureClass::Requeue);
        assert!(locked.message.contains("bob"));

        let config: JobError = AutomationError::Configuration("owner property".into()).into();
        assert_eq!(config.class, FailureClass::Fatal);

        let aborted: JobError = AutomationError::Aborted.into();
        assert_eq!(aborted.class, FailureClass::Aborted);

        let cancelled: JobError = AutomationError::Cancelled.into();
        assert_eq!(cancelled.class, FailureClass::Cancelled);
    }

    #[test]
    fn test_signal_reports_cancel_before_abort() {
        let cancel = CancellationToken::new();
        let abort = CancellationToken::new();
        let signal = CancellationSignal::new(cancel.clone(), abort.clone());
        assert!(signal.check().is_ok());

        abort.cancel();
        assert!(matches!(signal.check(), Err(AutomationError::Aborted)));

        cancel.cancel();
        assert!(matches!(signal.check(), Err(AutomationError::Cancelled)));
    }
}
