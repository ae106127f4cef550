// Configuration loading and per-invocation snapshots

//! # Configuration
//!
//! [`AutomationConfig`] is assembled by the `config` crate from an optional
//! file (TOML, JSON or YAML, picked by extension) followed by environment
//! variables prefixed with `VAULT_AUTOMATION`, using `__` to reach nested keys:
//!
//! ```text
//! VAULT_AUTOMATION__QUEUE__MAX_CONCURRENT=8
//! VAULT_AUTOMATION__MIGRATE_CONTRACTS__ENABLED=true
//! ```
//!
//! Every section has defaults, so an empty configuration is valid and simply
//! leaves the automations disabled.
//!
//! [`ConfigStore`] publishes the current configuration through a
//! `tokio::sync::watch` channel. Hooks and processors call
//! [`ConfigStore::snapshot`] once per invocation and work from that immutable
//! snapshot; a reload never changes configuration under a running task.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::logging::LoggingConfig;
use crate::models::RetryPolicy;
use crate::modules::ensure_prerequisites::EnsurePrerequisitesConfig;
use crate::modules::generate_documents::GenerateDocumentsConfig;
use crate::modules::import_gists::ImportGistsConfig;
use crate::modules::migrate_contracts::MigrateContractsConfig;
use crate::modules::shared_links::SharedLinksConfig;
use crate::modules::upload_to_finance::UploadToFinanceConfig;
use crate::{AutomationError, Result};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "VAULT_AUTOMATION";

/// Complete configuration of the automation engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub logging: LoggingConfig,
    pub queue: QueueConfig,
    pub migrate_contracts: MigrateContractsConfig,
    pub upload_to_finance: UploadToFinanceConfig,
    pub ensure_prerequisites: EnsurePrerequisitesConfig,
    pub import_gists: ImportGistsConfig,
    pub generate_documents: GenerateDocumentsConfig,
    pub shared_links: SharedLinksConfig,
}

/// Task queue settings
///
/// Queue and task type names are fixed by the processors; only the execution
/// envelope is configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub poll_interval_ms: u64,
    /// Upper bound on concurrently running handlers
    pub max_concurrent: usize,
    /// Timeout for `Full` transaction-mode handlers
    pub full_mode_timeout_ms: u64,
    /// Name recorded as lock holder for edits made by the engine
    pub lock_actor: String,
    pub retry: RetryPolicy,
    /// Finished entries older than this are pruned by the running dispatcher
    pub retain_finished_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_concurrent: 4,
            full_mode_timeout_ms: 90_000,
            lock_actor: "vault-automation".to_string(),
            retry: RetryPolicy::default(),
            retain_finished_secs: 7 * 24 * 3600,
        }
    }
}

impl AutomationConfig {
    /// Load from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| AutomationError::Configuration(format!("failed to load configuration: {}", e)))
    }
}

/// Holder of the current configuration
#[derive(Clone)]
pub struct ConfigStore {
    sender: Arc<watch::Sender<Arc<AutomationConfig>>>,
}

impl ConfigStore {
    pub fn new(config: AutomationConfig) -> Self {
        let (sender, _) = watch::channel(Arc::new(config));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Immutable snapshot for one hook or processor invocation
    pub fn snapshot(&self) -> Arc<AutomationConfig> {
        self.sender.borrow().clone()
    }

    /// Publish a new configuration; running invocations keep their snapshot
    pub fn replace(&self, config: AutomationConfig) {
        self.sender.send_replace(Arc::new(config));
    }

    /// Receiver that observes configuration changes
    pub fn subscribe(&self) -> watch::Receiver<Arc<AutomationConfig>> {
        self.sender.subscribe()
    }
}
