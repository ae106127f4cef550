// Task queue: registration, dispatch and outcome handling

//! # Task Queue
//!
//! [`TaskQueue`] connects a [`QueueStore`] with the registered
//! [`TaskProcessor`]s. It is pull based: an entry is claimed from the store,
//! dispatched to the processor registered for its (queue, task type) and the
//! processor's outcome decides what happens to the entry.
//!
//! ## Transaction Modes
//!
//! - `Full`: the handler receives a repository transaction and runs under a
//!   timeout. Success commits; failure, cancellation, panic or timeout roll
//!   back, so a redelivery never observes partial state.
//! - `Unsafe`: the handler works directly on the repository without a timeout
//!   and must be resumable on its own.
//!
//! ## Outcomes
//!
//! | outcome | entry |
//! |---|---|
//! | success | `Done`; follow-up tasks are enqueued |
//! | `Requeue` | back to `Pending` after the retry policy's delay, or `Failed` once attempts run out |
//! | `Fatal` | `Failed`, error retained, reported on the event bus |
//! | cancelled | `Cancelled` |
//! | aborted by shutdown | back to `Pending` at once; the attempt is not counted |
//!
//! ## Retention
//!
//! A recurring series keeps only its most recent finished occurrence. Other
//! finished entries are pruned by the running dispatcher once they are older
//! than `queue.retain_finished_secs`.
//!
//! ## Workers
//!
//! [`TaskQueue::start`] runs a dispatcher that keeps at most
//! `queue.max_concurrent` handlers in flight (a `Semaphore`). Stopping the
//! runner raises the abort signal; handlers notice it at their next
//! cancellation check and their entries are requeued.
//!
//! ## Rust Learning Notes:
//!
//! ### Catching Panics in Async Code
//! `FutureExt::catch_unwind` from the `futures` crate turns a panicking handler
//! into an ordinary error, so one broken processor cannot leave an entry stuck
//! in `InProgress` or take a worker down with it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::{EventBus, QueueEventKind};
use super::job::{CancellationSignal, FailureClass, FollowUp, JobError, TaskJob, TaskProcessor};
use super::queue_store::QueueStore;
use super::repository::Repository;
use crate::config::{AutomationConfig, ConfigStore};
use crate::models::queue_entry::chrono_delay;
use crate::models::{EntryState, QueueEntry, TaskDirective, TransactionMode};
use crate::{AutomationError, Result};

/// Queue used by the built-in automations
pub const DEFAULT_QUEUE_ID: &str = "VaultAutomation.Tasks";

/// How often an idle dispatcher looks for expired finished entries
const PRUNE_INTERVAL: Duration = Duration::from_secs(600);

/// What happened to an entry after one delivery
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed,
    Requeued { delay: Duration, reason: String },
    Failed { message: String },
    Cancelled,
}

/// Result of processing one entry inline
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedEntry {
    pub id: Uuid,
    pub task_type: String,
    pub outcome: TaskOutcome,
}

type Registration = (String, String);

/// Durable task queue with typed processors
pub struct TaskQueue {
    store: Arc<dyn QueueStore>,
    repository: Arc<dyn Repository>,
    config: ConfigStore,
    events: EventBus,
    processors: DashMap<Registration, Arc<dyn TaskProcessor>>,
    running: DashMap<Uuid, CancellationToken>,
    wake: Notify,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn QueueStore>,
        repository: Arc<dyn Repository>,
        config: ConfigStore,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            repository,
            config,
            events,
            processors: DashMap::new(),
            running: DashMap::new(),
            wake: Notify::new(),
        }
    }

    /// Register the processor for its (queue, task type)
    pub fn register(&self, processor: Arc<dyn TaskProcessor>) {
        let key = (
            processor.queue_id().to_string(),
            processor.task_type().to_string(),
        );
        info!(
            queue = %key.0,
            task_type = %key.1,
            mode = ?processor.transaction_mode(),
            "Registered task processor"
        );
        self.processors.insert(key, processor);
    }

    pub fn is_registered(&self, queue_id: &str, task_type: &str) -> bool {
        self.processors
            .contains_key(&(queue_id.to_string(), task_type.to_string()))
    }

    pub fn registrations(&self) -> Vec<(String, String)> {
        self.processors.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    fn mode_for(&self, queue_id: &str, task_type: &str) -> Result<TransactionMode> {
        self.processors
            .get(&(queue_id.to_string(), task_type.to_string()))
            .map(|processor| processor.transaction_mode())
            .ok_or_else(|| {
                AutomationError::Configuration(format!(
                    "no processor registered for task type '{}' on queue '{}'",
                    task_type, queue_id
                ))
            })
    }

    /// Add a directive to the queue
    ///
    /// ## Errors
    /// - `Configuration` if no processor handles (queue, task type); such an
    ///   entry would never be delivered
    pub async fn enqueue<D: TaskDirective>(
        &self,
        queue_id: &str,
        task_type: &str,
        directive: &D,
    ) -> Result<Uuid> {
        let entry = self.build_entry(
            queue_id,
            task_type,
            serde_json::to_value(directive)?,
            directive.display_name().map(str::to_string),
        )?;
        self.insert(entry).await
    }

    /// Make sure a recurring entry exists for (queue, task type)
    ///
    /// Returns the live entry if one is already pending or running.
    pub async fn schedule_recurring<D: TaskDirective>(
        &self,
        queue_id: &str,
        task_type: &str,
        directive: &D,
        interval: Duration,
    ) -> Result<Uuid> {
        let live = self.store.list().await?.into_iter().find(|entry| {
            entry.queue_id == queue_id
                && entry.task_type == task_type
                && entry.recurrence_secs.is_some()
                && !entry.state.is_terminal()
        });
        if let Some(entry) = live {
            debug!(entry_id = %entry.id, task_type, "Recurring task already scheduled");
            return Ok(entry.id);
        }

        let entry = self
            .build_entry(
                queue_id,
                task_type,
                serde_json::to_value(directive)?,
                directive.display_name().map(str::to_string),
            )?
            .recurring(interval);
        self.insert(entry).await
    }

    fn build_entry(
        &self,
        queue_id: &str,
        task_type: &str,
        directive: serde_json::Value,
        display_name: Option<String>,
    ) -> Result<QueueEntry> {
        let mode = self.mode_for(queue_id, task_type)?;
        Ok(QueueEntry::new(queue_id, task_type, mode, directive, display_name))
    }

    async fn insert(&self, entry: QueueEntry) -> Result<Uuid> {
        let entry = self.store.insert(entry).await?;
        info!(entry_id = %entry.id, task_type = %entry.task_type, name = entry.label(), "Enqueued task");
        self.events.emit(
            entry.id,
            &entry.task_type,
            entry.display_name.as_deref(),
            QueueEventKind::Enqueued,
        );
        self.wake.notify_one();
        Ok(entry.id)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<QueueEntry>> {
        self.store.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<QueueEntry>> {
        self.store.list().await
    }

    /// Cancel an entry
    ///
    /// Pending entries are cancelled immediately. Running entries get their
    /// cancellation token raised and stop at the handler's next check; the
    /// returned state is then still `InProgress`.
    pub async fn cancel(&self, id: Uuid) -> Result<EntryState> {
        let mut entry = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| AutomationError::Queue(format!("unknown queue entry {}", id)))?;

        match entry.state {
            EntryState::Pending => {
                entry.state = EntryState::Cancelled;
                entry.finished_at = Some(Utc::now());
                self.store.update(&entry).await?;
                self.events.emit(
                    entry.id,
                    &entry.task_type,
                    entry.display_name.as_deref(),
                    QueueEventKind::Cancelled,
                );
                info!(entry_id = %id, "Cancelled pending task");
                Ok(EntryState::Cancelled)
            }
            EntryState::InProgress => match self.running.get(&id) {
                Some(token) => {
                    token.cancel();
                    info!(entry_id = %id, "Requested cancellation of running task");
                    Ok(EntryState::InProgress)
                }
                None => Err(AutomationError::Queue(format!(
                    "entry {} is running in another process",
                    id
                ))),
            },
            state => Ok(state),
        }
    }

    /// Put a failed or cancelled entry back into the queue with fresh attempts
    pub async fn retry(&self, id: Uuid) -> Result<()> {
        let mut entry = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| AutomationError::Queue(format!("unknown queue entry {}", id)))?;
        if !matches!(entry.state, EntryState::Failed | EntryState::Cancelled) {
            return Err(AutomationError::Queue(format!(
                "entry {} is {} and cannot be retried",
                id, entry.state
            )));
        }
        entry.state = EntryState::Pending;
        entry.attempts = 0;
        entry.available_at = Utc::now();
        entry.finished_at = None;
        self.store.update(&entry).await?;
        self.wake.notify_one();
        Ok(())
    }

    async fn claim(&self) -> Result<Option<QueueEntry>> {
        self.store.claim_next(Utc::now(), &self.registrations()).await
    }

    /// Claim and process one due entry on the current task
    pub async fn run_next(&self) -> Result<Option<ProcessedEntry>> {
        match self.claim().await? {
            Some(entry) => {
                let id = entry.id;
                let task_type = entry.task_type.clone();
                let outcome = self.execute(entry, CancellationToken::new()).await?;
                Ok(Some(ProcessedEntry {
                    id,
                    task_type,
                    outcome,
                }))
            }
            None => Ok(None),
        }
    }

    /// Process due entries until none is left
    ///
    /// Requeued entries become due again only after their retry delay, so with
    /// a zero-delay policy this keeps redelivering until attempts run out.
    pub async fn run_until_idle(&self) -> Result<Vec<ProcessedEntry>> {
        let mut processed = Vec::new();
        while let Some(entry) = self.run_next().await? {
            processed.push(entry);
        }
        Ok(processed)
    }

    /// Start the background dispatcher
    pub fn start(self: &Arc<Self>) -> QueueRunner {
        let config = self.config.snapshot();
        let max_concurrent = config.queue.max_concurrent.max(1);
        let poll_interval = Duration::from_millis(config.queue.poll_interval_ms.max(10));
        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(max_concurrent));

        info!(max_concurrent, "Starting task queue workers");
        let handle = tokio::spawn(dispatch_loop(
            self.clone(),
            semaphore.clone(),
            shutdown.clone(),
            abort.clone(),
            poll_interval,
        ));

        QueueRunner {
            shutdown,
            abort,
            semaphore,
            max_concurrent,
            handle,
        }
    }

    async fn execute(&self, entry: QueueEntry, abort: CancellationToken) -> Result<TaskOutcome> {
        let key = (entry.queue_id.clone(), entry.task_type.clone());
        let processor = self.processors.get(&key).map(|p| p.value().clone());
        let config = self.config.snapshot();

        let Some(processor) = processor else {
            let error = JobError::fatal(format!("no processor registered for '{}'", entry.task_type));
            return self.settle(entry, Err(error), &config).await;
        };

        info!(
            entry_id = %entry.id,
            task_type = %entry.task_type,
            name = entry.label(),
            attempt = entry.attempts,
            "Processing task"
        );
        self.events.emit(
            entry.id,
            &entry.task_type,
            entry.display_name.as_deref(),
            QueueEventKind::Started {
                attempt: entry.attempts,
            },
        );

        let cancel = CancellationToken::new();
        self.running.insert(entry.id, cancel.clone());
        let signal = CancellationSignal::new(cancel, abort);

        let result = match processor.transaction_mode() {
            TransactionMode::Full => {
                self.execute_full(processor.as_ref(), &entry, config.clone(), signal)
                    .await
            }
            TransactionMode::Unsafe => {
                self.execute_unsafe(processor.as_ref(), &entry, config.clone(), signal)
                    .await
            }
        };
        self.running.remove(&entry.id);

        self.settle(entry, result, &config).await
    }

    fn job(&self, entry: &QueueEntry, repository: Arc<dyn Repository>, config: Arc<AutomationConfig>, signal: CancellationSignal) -> TaskJob {
        TaskJob::new(
            entry.clone(),
            repository,
            config,
            signal,
            self.store.clone(),
            self.events.clone(),
        )
    }

    async fn execute_full(
        &self,
        processor: &dyn TaskProcessor,
        entry: &QueueEntry,
        config: Arc<AutomationConfig>,
        signal: CancellationSignal,
    ) -> std::result::Result<Vec<FollowUp>, JobError> {
        let timeout = Duration::from_millis(config.queue.full_mode_timeout_ms);
        let transaction = self.repository.begin().await?;
        let mut job = self.job(entry, transaction.clone().as_repository(), config, signal);

        let result = match tokio::time::timeout(timeout, guarded(processor, &mut job)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(entry_id = %entry.id, ?timeout, "Task exceeded its transaction timeout");
                Err(AutomationError::Timeout(timeout).into())
            }
        };

        match result {
            Ok(()) => match transaction.commit().await {
                Ok(()) => Ok(job.take_follow_ups()),
                Err(e) => {
                    if let Err(rollback) = transaction.rollback().await {
                        error!(entry_id = %entry.id, error = %rollback, "Rollback after failed commit failed");
                    }
                    Err(e.into())
                }
            },
            Err(e) => {
                if let Err(rollback) = transaction.rollback().await {
                    error!(entry_id = %entry.id, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn execute_unsafe(
        &self,
        processor: &dyn TaskProcessor,
        entry: &QueueEntry,
        config: Arc<AutomationConfig>,
        signal: CancellationSignal,
    ) -> std::result::Result<Vec<FollowUp>, JobError> {
        let mut job = self.job(entry, self.repository.clone(), config, signal);
        guarded(processor, &mut job).await?;
        Ok(job.take_follow_ups())
    }

    /// Apply a delivery's result to the stored entry
    async fn settle(
        &self,
        entry: QueueEntry,
        result: std::result::Result<Vec<FollowUp>, JobError>,
        config: &AutomationConfig,
    ) -> Result<TaskOutcome> {
        // Progress may have been written during the run.
        let mut entry = self.store.get(entry.id).await?.unwrap_or(entry);
        let now = Utc::now();

        let outcome = match result {
            Ok(follow_ups) => {
                entry.state = EntryState::Done;
                entry.finished_at = Some(now);
                entry.last_error = None;
                self.store.update(&entry).await?;
                info!(entry_id = %entry.id, task_type = %entry.task_type, "Task completed");
                self.emit(&entry, QueueEventKind::Completed);
                for follow_up in follow_ups {
                    self.enqueue_follow_up(follow_up).await?;
                }
                TaskOutcome::Completed
            }
            Err(error) => match error.class {
                FailureClass::Aborted => {
                    entry.attempts = entry.attempts.saturating_sub(1);
                    entry.state = EntryState::Pending;
                    entry.available_at = now;
                    entry.last_error = Some(error.message.clone());
                    self.store.update(&entry).await?;
                    info!(entry_id = %entry.id, task_type = %entry.task_type, "Task interrupted by shutdown");
                    self.emit(
                        &entry,
                        QueueEventKind::Requeued {
                            reason: error.message.clone(),
                            delay_ms: 0,
                        },
                    );
                    TaskOutcome::Requeued {
                        delay: Duration::ZERO,
                        reason: error.message,
                    }
                }
                FailureClass::Requeue if config.queue.retry.allows_retry(entry.attempts) => {
                    let delay = config.queue.retry.delay_for(entry.attempts);
                    entry.state = EntryState::Pending;
                    entry.available_at = now + chrono_delay(delay);
                    entry.last_error = Some(error.message.clone());
                    self.store.update(&entry).await?;
                    warn!(
                        entry_id = %entry.id,
                        task_type = %entry.task_type,
                        attempt = entry.attempts,
                        ?delay,
                        reason = %error.message,
                        "Task requeued"
                    );
                    self.emit(
                        &entry,
                        QueueEventKind::Requeued {
                            reason: error.message.clone(),
                            delay_ms: delay.as_millis() as u64,
                        },
                    );
                    TaskOutcome::Requeued {
                        delay,
                        reason: error.message,
                    }
                }
                FailureClass::Requeue => {
                    let message = format!(
                        "retry limit of {} attempts reached: {}",
                        entry.attempts, error.message
                    );
                    self.fail(&mut entry, message).await?
                }
                FailureClass::Fatal => self.fail(&mut entry, error.message).await?,
                FailureClass::Cancelled => {
                    entry.state = EntryState::Cancelled;
                    entry.finished_at = Some(now);
                    entry.last_error = Some(error.message);
                    self.store.update(&entry).await?;
                    info!(entry_id = %entry.id, "Task cancelled");
                    self.emit(&entry, QueueEventKind::Cancelled);
                    TaskOutcome::Cancelled
                }
            },
        };

        if matches!(entry.state, EntryState::Done | EntryState::Failed) {
            self.schedule_next_occurrence(&entry).await?;
        }
        Ok(outcome)
    }

    async fn fail(&self, entry: &mut QueueEntry, message: String) -> Result<TaskOutcome> {
        entry.state = EntryState::Failed;
        entry.finished_at = Some(Utc::now());
        entry.last_error = Some(message.clone());
        self.store.update(entry).await?;
        error!(
            entry_id = %entry.id,
            task_type = %entry.task_type,
            name = entry.label(),
            error = %message,
            "Task failed permanently"
        );
        self.emit(
            entry,
            QueueEventKind::Failed {
                message: message.clone(),
            },
        );
        Ok(TaskOutcome::Failed { message })
    }

    fn emit(&self, entry: &QueueEntry, kind: QueueEventKind) {
        self.events
            .emit(entry.id, &entry.task_type, entry.display_name.as_deref(), kind);
    }

    pub(crate) async fn enqueue_follow_up(&self, follow_up: FollowUp) -> Result<()> {
        let entry = self
            .build_entry(
                &follow_up.queue_id,
                &follow_up.task_type,
                follow_up.directive,
                follow_up.display_name,
            )?
            .available_after(follow_up.delay);
        self.insert(entry).await?;
        Ok(())
    }

    async fn schedule_next_occurrence(&self, entry: &QueueEntry) -> Result<()> {
        let Some(interval) = entry.recurrence_secs else {
            return Ok(());
        };
        let next = QueueEntry::new(
            entry.queue_id.clone(),
            entry.task_type.clone(),
            entry.mode,
            entry.directive.clone(),
            entry.display_name.clone(),
        )
        .available_after(Duration::from_secs(interval))
        .recurring(Duration::from_secs(interval));
        self.insert(next).await?;

        for older in self.store.list().await? {
            if older.id != entry.id
                && older.state.is_terminal()
                && older.recurrence_secs.is_some()
                && older.queue_id == entry.queue_id
                && older.task_type == entry.task_type
                && self.store.remove(older.id).await?
            {
                debug!(entry_id = %older.id, task_type = %older.task_type, "Removed earlier occurrence");
            }
        }
        Ok(())
    }

    /// Remove finished entries that ended before `cutoff`
    pub async fn prune_finished(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for entry in self.store.list().await? {
            let expired = entry.finished_at.map_or(false, |finished| finished < cutoff);
            if entry.state.is_terminal() && expired && self.store.remove(entry.id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Pruned finished queue entries");
        }
        Ok(removed)
    }

    async fn prune_expired(&self) {
        let retention = self.config.snapshot().queue.retain_finished_secs;
        let cutoff = Utc::now() - chrono_delay(Duration::from_secs(retention));
        if let Err(e) = self.prune_finished(cutoff).await {
            warn!(error = %e, "Failed to prune finished queue entries");
        }
    }
}

/// Run the processor, converting a panic into a fatal failure
async fn guarded(processor: &dyn TaskProcessor, job: &mut TaskJob) -> std::result::Result<(), JobError> {
    match AssertUnwindSafe(processor.process(job)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(JobError::fatal(format!(
            "processor for '{}' panicked",
            processor.task_type()
        ))),
    }
}

async fn dispatch_loop(
    queue: Arc<TaskQueue>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
    abort: CancellationToken,
    poll_interval: Duration,
) {
    let mut last_prune: Option<Instant> = None;
    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        match queue.claim().await {
            Ok(Some(entry)) => {
                let worker_queue = queue.clone();
                let abort = abort.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let id = entry.id;
                    if let Err(e) = worker_queue.execute(entry, abort).await {
                        error!(entry_id = %id, error = %e, "Failed to record task outcome");
                    }
                });
            }
            Ok(None) => {
                drop(permit);
                if last_prune.map_or(true, |at| at.elapsed() >= PRUNE_INTERVAL) {
                    queue.prune_expired().await;
                    last_prune = Some(Instant::now());
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = queue.wake.notified() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            Err(e) => {
                drop(permit);
                error!(error = %e, "Failed to claim next task");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }
    debug!("Task dispatcher stopped");
}

/// Handle to the running dispatcher
pub struct QueueRunner {
    shutdown: CancellationToken,
    abort: CancellationToken,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    handle: JoinHandle<()>,
}

impl QueueRunner {
    /// Stop dispatching, signal running handlers and wait for them to finish
    pub async fn stop(self) {
        info!("Stopping task queue workers");
        self.shutdown.cancel();
        self.abort.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "Task dispatcher ended abnormally");
        }
        // Every in-flight handler holds a permit until it has settled its entry.
        let _ = self
            .semaphore
            .acquire_many(self.max_concurrent as u32)
            .await;
        info!("Task queue workers stopped");
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
