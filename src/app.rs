// Application wiring: modules, queue and commit pipeline

//! # Automation App
//!
//! [`AutomationApp`] owns the configuration store, the repository, the task
//! queue and the registered modules. The repository host calls
//! [`AutomationApp::before_commit_finalize`] for every record change; the
//! worker binary calls [`AutomationApp::start`] and [`AutomationApp::stop`].
//!
//! ## Commit pipeline
//!
//! ```text
//! begin transaction
//!   -> module hooks, in registration order (first error vetoes)
//!   -> commit, or roll back on veto
//!   -> enqueue the directives the hooks asked for
//! ```
//!
//! Directives are only enqueued after the commit succeeded, so a vetoed change
//! never leaves queued work behind.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::{AutomationConfig, ConfigStore};
use crate::engine::{
    EventBus, InMemoryQueueStore, InMemoryRepository, QueueRunner, QueueStore, Repository,
    TaskQueue, DEFAULT_QUEUE_ID,
};
use crate::models::{Record, UserId};
use crate::modules::ensure_prerequisites::EnsurePrerequisitesModule;
use crate::modules::generate_documents::GenerateDocumentsModule;
use crate::modules::import_gists::{self, GistFeed, ImportGistsModule};
use crate::modules::migrate_contracts::MigrateContractsModule;
use crate::modules::shared_links::{LinkNotifier, SharedLinksModule};
use crate::modules::upload_to_finance::{FinanceUploader, SaveToDiskUploader, UploadToFinanceModule};
use crate::modules::{AutomationModule, CommitContext};
use crate::Result;

/// Builder for [`AutomationApp`]
///
/// Backends default to in-memory implementations. Without an explicit uploader
/// a [`SaveToDiskUploader`] is used when `upload_to_finance.output_path` is set.
pub struct AutomationAppBuilder {
    config: AutomationConfig,
    repository: Option<Arc<dyn Repository>>,
    queue_store: Option<Arc<dyn QueueStore>>,
    uploader: Option<Arc<dyn FinanceUploader>>,
    gist_feed: Option<Arc<dyn GistFeed>>,
    notifier: Option<Arc<dyn LinkNotifier>>,
}

impl AutomationAppBuilder {
    pub fn new(config: AutomationConfig) -> Self {
        Self {
            config,
            repository: None,
            queue_store: None,
            uploader: None,
            gist_feed: None,
            notifier: None,
        }
    }

    pub fn with_repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_queue_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.queue_store = Some(store);
        self
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn FinanceUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_gist_feed(mut self, feed: Arc<dyn GistFeed>) -> Self {
        self.gist_feed = Some(feed);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn LinkNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> AutomationApp {
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(InMemoryRepository::new()) as Arc<dyn Repository>);
        let store = self
            .queue_store
            .unwrap_or_else(|| Arc::new(InMemoryQueueStore::new()) as Arc<dyn QueueStore>);
        let uploader = self.uploader.or_else(|| {
            self.config
                .upload_to_finance
                .output_path
                .as_ref()
                .map(|path| Arc::new(SaveToDiskUploader::new(path.clone())) as Arc<dyn FinanceUploader>)
        });

        let config = ConfigStore::new(self.config);
        let queue = Arc::new(TaskQueue::new(
            store,
            repository.clone(),
            config.clone(),
            EventBus::new(),
        ));

        let modules: Vec<Arc<dyn AutomationModule>> = vec![
            Arc::new(EnsurePrerequisitesModule::new()),
            Arc::new(GenerateDocumentsModule::new()),
            Arc::new(MigrateContractsModule::new()),
            Arc::new(UploadToFinanceModule::new(uploader)),
            Arc::new(SharedLinksModule::new(self.notifier)),
            Arc::new(ImportGistsModule::new(self.gist_feed)),
        ];
        for module in &modules {
            for processor in module.clone().processors() {
                queue.register(processor);
            }
        }
        info!(modules = modules.len(), "Automation modules registered");

        AutomationApp {
            config,
            repository,
            queue,
            modules,
            runner: Mutex::new(None),
        }
    }
}

/// Running automation engine
pub struct AutomationApp {
    config: ConfigStore,
    repository: Arc<dyn Repository>,
    queue: Arc<TaskQueue>,
    modules: Vec<Arc<dyn AutomationModule>>,
    runner: Mutex<Option<QueueRunner>>,
}

impl AutomationApp {
    pub fn builder(config: AutomationConfig) -> AutomationAppBuilder {
        AutomationAppBuilder::new(config)
    }

    pub fn config(&self) -> Arc<AutomationConfig> {
        self.config.snapshot()
    }

    /// Publish a new configuration; running tasks keep their snapshot
    pub fn reload_config(&self, config: AutomationConfig) {
        info!("Configuration reloaded");
        self.config.replace(config);
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|module| module.name())
    }

    /// Run every module hook for a record change
    ///
    /// Returns the record as changed by the hooks. The caller persists it.
    ///
    /// ## Errors
    /// - The first error raised by a hook; everything the hooks wrote is rolled
    ///   back and nothing is enqueued
    pub async fn before_commit_finalize(
        &self,
        record: Record,
        previous: Option<Record>,
        user: UserId,
    ) -> Result<Record> {
        let transaction = self.repository.begin().await?;
        let mut ctx = CommitContext::new(
            record,
            previous,
            user,
            transaction.clone().as_repository(),
            self.config.snapshot(),
            self.queue.clone(),
        );

        for module in &self.modules {
            if let Err(e) = module.before_commit_finalize(&mut ctx).await {
                warn!(
                    module = module.name(),
                    record = %ctx.record.reference,
                    error = %e,
                    "Change rejected"
                );
                if let Err(rollback) = transaction.rollback().await {
                    error!(error = %rollback, "Rollback of rejected change failed");
                }
                return Err(e);
            }
        }
        transaction.commit().await?;

        for follow_up in ctx.take_pending() {
            self.queue.enqueue_follow_up(follow_up).await?;
        }
        Ok(ctx.record)
    }

    /// Seed recurring work and start the queue workers
    pub async fn start(&self) -> Result<()> {
        let mut runner = self.runner.lock().await;
        if runner.is_some() {
            return Ok(());
        }

        let config = self.config.snapshot();
        if config.import_gists.enabled {
            self.queue
                .schedule_recurring(
                    DEFAULT_QUEUE_ID,
                    import_gists::TASK_TYPE,
                    &ImportGistsModule::directive(),
                    config.import_gists.interval(),
                )
                .await?;
        }
        *runner = Some(self.queue.start());
        info!("Automation app started");
        Ok(())
    }

    /// Stop the workers, waiting for running tasks to settle
    pub async fn stop(&self) {
        if let Some(runner) = self.runner.lock().await.take() {
            runner.stop().await;
        }
        info!("Automation app stopped");
    }
}
