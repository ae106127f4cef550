// Invoice export to the finance system

//! # Upload to Finance
//!
//! Invoices matching the trigger are queued for upload when they are committed.
//! The `UploadToFinance` processor runs in `Full` mode, so the property updates
//! written after a successful upload are rolled back together with everything
//! else if the delivery fails.
//!
//! The actual transfer goes through a [`FinanceUploader`]. [`SaveToDiskUploader`]
//! drops the invoice metadata and a file manifest into a folder that the finance
//! system picks up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{AutomationModule, CommitContext};
use crate::engine::{JobError, JobResult, TaskJob, TaskProcessor, TriggerEvaluator, ConditionMatcher};
use crate::models::{
    ObjectDirective, PropertyChanges, PropertyId, PropertyValue, Record, RecordFile, RecordRef,
    TransactionMode, Trigger,
};
use crate::{AutomationError, Result};

pub const TASK_TYPE: &str = "UploadToFinance";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadToFinanceConfig {
    pub enabled: bool,
    /// Drop folder for [`SaveToDiskUploader`]
    pub output_path: Option<PathBuf>,
    pub trigger: Option<Trigger>,
    /// Properties written on the invoice after a successful upload
    pub updated_values: Vec<UpdatedValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatedValue {
    pub property: PropertyId,
    pub action: ValueAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueAction {
    Static { value: PropertyValue },
    SetToNull,
}

/// Transfer of one invoice to the finance system
#[async_trait]
pub trait FinanceUploader: Send + Sync {
    async fn upload(&self, invoice: &Record) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct InvoiceMetadata<'a> {
    record: RecordRef,
    version: u64,
    title: &'a str,
    modified_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ManifestEntry<'a> {
    name: String,
    size: u64,
    source_url: Option<&'a str>,
}

/// Writes `{uuid}.json` and `{uuid}.files.json` into a drop folder
#[derive(Debug, Clone)]
pub struct SaveToDiskUploader {
    output_path: PathBuf,
}

impl SaveToDiskUploader {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
        }
    }

    async fn write(&self, id: Uuid, invoice: &Record) -> Result<()> {
        tokio::fs::create_dir_all(&self.output_path).await?;

        let metadata = InvoiceMetadata {
            record: invoice.reference,
            version: invoice.version,
            title: &invoice.title,
            modified_at: invoice.modified_at,
        };
        let path = self.output_path.join(format!("{}.json", id));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&metadata)?).await?;

        let manifest: Vec<ManifestEntry> = invoice.files.iter().map(manifest_entry).collect();
        let path = self.output_path.join(format!("{}.files.json", id));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&manifest)?).await?;
        Ok(())
    }

    /// Remove everything written for `id`
    async fn clean_up(&self, id: Uuid) {
        let prefix = format!("{}.", id);
        let Ok(mut entries) = tokio::fs::read_dir(&self.output_path).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    warn!(path = %entry.path().display(), error = %e, "Could not remove partial upload");
                }
            }
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }
}

fn manifest_entry(file: &RecordFile) -> ManifestEntry<'_> {
    ManifestEntry {
        name: file.file_name(),
        size: file.size,
        source_url: file.source_url.as_deref(),
    }
}

#[async_trait]
impl FinanceUploader for SaveToDiskUploader {
    async fn upload(&self, invoice: &Record) -> Result<()> {
        let id = Uuid::new_v4();
        match self.write(id, invoice).await {
            Ok(()) => {
                info!(record = %invoice.reference, id = %id, "Saved invoice for finance");
                Ok(())
            }
            Err(e) => {
                self.clean_up(id).await;
                Err(e)
            }
        }
    }
}

fn updated_values(values: &[UpdatedValue]) -> Result<PropertyChanges> {
    let mut changes = PropertyChanges::new().comment("Uploaded to finance");
    for value in values {
        if value.property < 0 {
            return Err(AutomationError::Configuration(format!(
                "Cannot update built-in property {} after upload",
                value.property
            )));
        }
        let new_value = match &value.action {
            ValueAction::Static { value } => value.clone(),
            ValueAction::SetToNull => PropertyValue::Null,
        };
        changes = changes.set(value.property, new_value);
    }
    Ok(changes)
}

pub struct UploadToFinanceModule {
    uploader: Option<Arc<dyn FinanceUploader>>,
}

impl UploadToFinanceModule {
    pub fn new(uploader: Option<Arc<dyn FinanceUploader>>) -> Self {
        Self { uploader }
    }
}

#[async_trait]
impl AutomationModule for UploadToFinanceModule {
    fn name(&self) -> &str {
        "Upload invoices to finance"
    }

    async fn before_commit_finalize(&self, ctx: &mut CommitContext) -> Result<()> {
        let config = &ctx.config.upload_to_finance;
        if !config.enabled {
            debug!("Upload to finance is disabled in configuration");
            return Ok(());
        }
        let Some(trigger) = &config.trigger else {
            return Ok(());
        };
        if !ctx.evaluator().matches_trigger(&ctx.record, trigger).await? {
            return Ok(());
        }

        info!(record = %ctx.record.reference, title = %ctx.record.title, "Queuing invoice for upload");
        let directive = ObjectDirective::new(ctx.record.reference, ctx.record.title.clone());
        ctx.enqueue(TASK_TYPE, &directive)
    }

    fn processors(self: Arc<Self>) -> Vec<Arc<dyn TaskProcessor>> {
        vec![self]
    }
}

#[async_trait]
impl TaskProcessor for UploadToFinanceModule {
    fn task_type(&self) -> &str {
        TASK_TYPE
    }

    fn transaction_mode(&self) -> TransactionMode {
        TransactionMode::Full
    }

    async fn process(&self, job: &mut TaskJob) -> JobResult {
        let config = job.config().upload_to_finance.clone();
        if !config.enabled {
            info!("Upload to finance is disabled in configuration; re-queuing task");
            return Err(JobError::requeue("upload to finance is disabled"));
        }
        let Some(uploader) = &self.uploader else {
            error!("No finance uploader is configured");
            return Err(JobError::fatal("no finance uploader is configured"));
        };

        let directive: ObjectDirective = job.directive()?;
        let reference = directive
            .record
            .record_ref()
            .ok_or_else(|| JobError::fatal("directive does not name an invoice"))?;
        let repository = job.repository().clone();
        let invoice = repository
            .get_record(&reference)
            .await?
            .ok_or(AutomationError::RecordNotFound(reference))?;

        let evaluator = TriggerEvaluator::new(ConditionMatcher::new(repository.clone()));
        let still_matches = match &config.trigger {
            Some(trigger) => evaluator.matches_trigger(&invoice, trigger).await?,
            None => false,
        };
        if !still_matches {
            info!(record = %reference, "Invoice no longer matches the upload trigger; skipping");
            return Ok(());
        }
        if invoice.is_checked_out() {
            return Err(JobError::requeue(format!("invoice {} is checked out", reference)));
        }
        let changes = updated_values(&config.updated_values)?;

        let handle = repository.lock(&reference, &job.config().queue.lock_actor).await?;
        let result = async {
            uploader.upload(&invoice).await.map_err(|e| {
                error!(record = %reference, error = %e, "Upload to finance failed");
                JobError::fatal(format!("upload failed: {}", e))
            })?;
            repository.save_properties(&handle, &changes).await?;
            Ok::<(), JobError>(())
        }
        .await;
        repository.unlock(handle).await?;
        result?;

        info!(record = %reference, title = %invoice.title, "Invoice uploaded to finance");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutomationConfig, ConfigStore};
    use crate::engine::{
        EventBus, InMemoryQueueStore, InMemoryRepository, Repository, TaskOutcome, TaskQueue,
        DEFAULT_QUEUE_ID,
    };
    use crate::models::{ConditionType, RetryPolicy, SearchCondition};
    use crate::modules::testing;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const INVOICE_CLASS: i32 = 20;
    const APPROVED: PropertyId = 1200;
    const UPLOADED: PropertyId = 1201;
    const ERROR_TEXT: PropertyId = 1202;

    #[derive(Default)]
    struct CountingUploader {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl FinanceUploader for CountingUploader {
        async fn upload(&self, _invoice: &Record) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AutomationError::Storage(anyhow::anyhow!("finance system offline")));
            }
            Ok(())
        }
    }

    fn config() -> AutomationConfig {
        let mut config = AutomationConfig::default();
        config.queue.retry = RetryPolicy::immediate(Some(2));
        config.upload_to_finance = UploadToFinanceConfig {
            enabled: true,
            output_path: None,
            trigger: Some(
                Trigger::default()
                    .and(SearchCondition::new(
                        crate::models::Expression::Class,
                        ConditionType::Equal,
                        PropertyValue::Integer(INVOICE_CLASS as i64),
                    ))
                    .and(SearchCondition::property(APPROVED, ConditionType::Equal, PropertyValue::Boolean(true))),
            ),
            updated_values: vec![
                UpdatedValue {
                    property: UPLOADED,
                    action: ValueAction::Static {
                        value: PropertyValue::Boolean(true),
                    },
                },
                UpdatedValue {
                    property: ERROR_TEXT,
                    action: ValueAction::SetToNull,
                },
            ],
        };
        config
    }

    fn invoice() -> Record {
        Record::new(RecordRef::new(0, 1), INVOICE_CLASS, "Invoice 2024-001")
            .with_property(APPROVED, PropertyValue::Boolean(true))
            .with_property(ERROR_TEXT, PropertyValue::Text("previous failure".into()))
    }

    async fn setup(
        config: AutomationConfig,
        uploader: Option<Arc<dyn FinanceUploader>>,
    ) -> (Arc<InMemoryRepository>, Arc<TaskQueue>) {
        let repository = Arc::new(InMemoryRepository::new());
        repository.insert_record(invoice()).await;
        let queue = Arc::new(TaskQueue::new(
            Arc::new(InMemoryQueueStore::new()),
            repository.clone(),
            ConfigStore::new(config),
            EventBus::new(),
        ));
        for processor in Arc::new(UploadToFinanceModule::new(uploader)).processors() {
            queue.register(processor);
        }
        queue
            .enqueue(DEFAULT_QUEUE_ID, TASK_TYPE, &ObjectDirective::new(RecordRef::new(0, 1), "Invoice 2024-001"))
            .await
            .unwrap();
        (repository, queue)
    }

    async fn stored(repository: &InMemoryRepository) -> Record {
        repository.get_record(&RecordRef::new(0, 1)).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_hook_enqueues_matching_invoice() {
        let repository = Arc::new(InMemoryRepository::new());
        let config = config();
        let queue = testing::queue(repository.clone(), &config);
        queue.register(Arc::new(UploadToFinanceModule::new(None)));
        let mut ctx = testing::context(invoice(), None, repository.clone(), config.clone(), queue.clone());

        UploadToFinanceModule::new(None).before_commit_finalize(&mut ctx).await.unwrap();
        let pending = ctx.take_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].display_name.as_deref(), Some("Invoice 2024-001"));

        let draft = invoice().with_property(APPROVED, PropertyValue::Boolean(false));
        let mut ctx = testing::context(draft, None, repository, config, queue);
        UploadToFinanceModule::new(None).before_commit_finalize(&mut ctx).await.unwrap();
        assert!(ctx.take_pending().is_empty());
    }

    #[tokio::test]
    async fn test_upload_sets_values_and_checks_in() {
        let uploader = Arc::new(CountingUploader::default());
        let (repository, queue) = setup(config(), Some(uploader.clone())).await;

        let processed = queue.run_next().await.unwrap().unwrap();
        assert_eq!(processed.outcome, TaskOutcome::Completed);
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 1);

        let invoice = stored(&repository).await;
        assert_eq!(invoice.property(UPLOADED), Some(&PropertyValue::Boolean(true)));
        assert_eq!(invoice.property(ERROR_TEXT), Some(&PropertyValue::Null));
        assert_eq!(repository.lock_holder(&invoice.reference).await, None);
    }

    #[tokio::test]
    async fn test_failed_upload_is_fatal_and_leaves_invoice_untouched() {
        let uploader = Arc::new(CountingUploader {
            fail: true,
            ..CountingUploader::default()
        });
        let (repository, queue) = setup(config(), Some(uploader)).await;

        let processed = queue.run_until_idle().await.unwrap();
        assert_eq!(processed.len(), 1);
        assert!(matches!(&processed[0].outcome, TaskOutcome::Failed { message } if message.contains("offline")));
        assert_eq!(stored(&repository).await.property(UPLOADED), None);
        assert_eq!(repository.lock_holder(&RecordRef::new(0, 1)).await, None);
    }

    #[tokio::test]
    async fn test_invoice_no_longer_matching_is_skipped() {
        let uploader = Arc::new(CountingUploader::default());
        let mut config = config();
        config.upload_to_finance.trigger = Some(Trigger::default().and(SearchCondition::property(
            APPROVED,
            ConditionType::Equal,
            PropertyValue::Boolean(false),
        )));
        let (_repository, queue) = setup(config, Some(uploader.clone())).await;

        let processed = queue.run_next().await.unwrap().unwrap();
        assert_eq!(processed.outcome, TaskOutcome::Completed);
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_locked_invoice_is_requeued() {
        let uploader = Arc::new(CountingUploader::default());
        let (repository, queue) = setup(config(), Some(uploader.clone())).await;
        let handle = repository.lock(&RecordRef::new(0, 1), "accountant").await.unwrap();

        let processed = queue.run_next().await.unwrap().unwrap();
        assert!(matches!(processed.outcome, TaskOutcome::Requeued { .. }));
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 0);

        repository.unlock(handle).await.unwrap();
        let processed = queue.run_next().await.unwrap().unwrap();
        assert_eq!(processed.outcome, TaskOutcome::Completed);
    }

    #[tokio::test]
    async fn test_disabled_requeues_and_missing_uploader_fails() {
        let mut disabled = config();
        disabled.upload_to_finance.enabled = false;
        let (_repository, queue) = setup(disabled, None).await;
        let processed = queue.run_next().await.unwrap().unwrap();
        assert!(matches!(processed.outcome, TaskOutcome::Requeued { .. }));

        let (_repository, queue) = setup(config(), None).await;
        let processed = queue.run_next().await.unwrap().unwrap();
        assert!(matches!(&processed.outcome, TaskOutcome::Failed { message } if message.contains("uploader")));
    }

    #[tokio::test]
    async fn test_negative_property_is_fatal_before_upload() {
        let uploader = Arc::new(CountingUploader::default());
        let mut config = config();
        config.upload_to_finance.updated_values.push(UpdatedValue {
            property: -1,
            action: ValueAction::SetToNull,
        });
        let (_repository, queue) = setup(config, Some(uploader.clone())).await;

        let processed = queue.run_next().await.unwrap().unwrap();
        assert!(matches!(processed.outcome, TaskOutcome::Failed { .. }));
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_save_to_disk_writes_metadata_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = SaveToDiskUploader::new(dir.path().join("finance"));
        let invoice = invoice().with_file(RecordFile {
            title: "invoice".into(),
            extension: "pdf".into(),
            size: 1024,
            source_url: None,
        });

        uploader.upload(&invoice).await.unwrap();

        let mut names: Vec<String> = std::fs::read_dir(uploader.output_path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names[0].ends_with(".files.json"));
        assert!(names[1].ends_with(".json"));

        let manifest = std::fs::read_to_string(uploader.output_path().join(&names[0])).unwrap();
        assert!(manifest.contains("invoice.pdf"));
        let metadata = std::fs::read_to_string(uploader.output_path().join(&names[1])).unwrap();
        assert!(metadata.contains("Invoice 2024-001"));
    }

    #[test]
    fn test_updated_values_deserialize() {
        let values: Vec<UpdatedValue> = serde_json::from_value(serde_json::json!([
            { "property": 1201, "action": { "type": "static", "value": { "type": "Boolean", "value": true } } },
            { "property": 1202, "action": { "type": "set_to_null" } }
        ]))
        .unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[1].action, ValueAction::SetToNull);
    }
}
