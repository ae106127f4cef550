// Scheduled import of gists into the repository

//! # Import Gists
//!
//! A recurring `ImportGists` task synchronizes a gist feed into one object
//! type and class:
//!
//! 1. every gist is upserted by external id (the gist id), with the node id as
//!    title, its URL and mapped fields as properties and its files as a manifest;
//! 2. existing records that are checked out are left alone;
//! 3. records of the target class whose external id is no longer in the feed
//!    are destroyed.
//!
//! The task runs in `Full` mode, so a failure halfway leaves the repository as
//! it was before the run. A feed that cannot be read requeues the task.
//!
//! Gist fields are exposed as columns through [`GIST_COLUMNS`]; the
//! configuration maps column names to repository properties.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::AutomationModule;
use crate::engine::{
    JobError, JobResult, PageRequest, Repository, SegmentedIterator, TaskJob, TaskProcessor,
};
use crate::models::{
    ClassId, EmptyDirective, NewRecord, ObjectTypeId, PropertyChanges, PropertyId, PropertyValue,
    Record, RecordFile, RecordRef, SearchFilter, TransactionMode,
};
use crate::{AutomationError, Result};

pub const TASK_TYPE: &str = "ImportGists";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportGistsConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub target_object_type: Option<ObjectTypeId>,
    pub target_class: Option<ClassId>,
    /// Property receiving the gist's API URL
    pub url_property: Option<PropertyId>,
    /// Additional gist columns to copy, by column name
    pub field_properties: BTreeMap<String, PropertyId>,
}

impl Default for ImportGistsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 3600,
            target_object_type: None,
            target_class: None,
            url_property: None,
            field_properties: BTreeMap::new(),
        }
    }
}

impl ImportGistsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GistFile {
    pub filename: String,
    #[serde(rename = "type", default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub raw_url: Option<String>,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GistOwner {
    pub login: String,
    #[serde(default)]
    pub html_url: Option<String>,
}

/// One gist as returned by the public gists API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gist {
    pub url: String,
    pub id: String,
    pub node_id: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub files: BTreeMap<String, GistFile>,
    #[serde(default)]
    pub public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub comments: i64,
    #[serde(default)]
    pub owner: Option<GistOwner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Boolean,
    Date,
}

/// Gist columns and their repository datatypes
pub const GIST_COLUMNS: &[(&str, ColumnType)] = &[
    ("url", ColumnType::Text),
    ("id", ColumnType::Text),
    ("node_id", ColumnType::Text),
    ("html_url", ColumnType::Text),
    ("public", ColumnType::Boolean),
    ("created_at", ColumnType::Date),
    ("updated_at", ColumnType::Date),
    ("description", ColumnType::Text),
    ("comments", ColumnType::Integer),
    ("owner", ColumnType::Text),
];

impl Gist {
    /// Value of a column, converted to its mapped datatype
    pub fn column(&self, name: &str) -> Result<PropertyValue> {
        let column_type = GIST_COLUMNS
            .iter()
            .find(|(column, _)| *column == name)
            .map(|(_, column_type)| *column_type)
            .ok_or_else(|| AutomationError::Configuration(format!("Gists have no column '{}'", name)))?;

        let value = match (name, column_type) {
            ("public", ColumnType::Boolean) => PropertyValue::Boolean(self.public),
            ("created_at", ColumnType::Date) => PropertyValue::Timestamp(self.created_at),
            ("updated_at", ColumnType::Date) => PropertyValue::Timestamp(self.updated_at),
            ("comments", ColumnType::Integer) => PropertyValue::Integer(self.comments),
            ("url", _) => PropertyValue::Text(self.url.clone()),
            ("id", _) => PropertyValue::Text(self.id.clone()),
            ("node_id", _) => PropertyValue::Text(self.node_id.clone()),
            ("html_url", _) => PropertyValue::Text(self.html_url.clone()),
            ("description", _) => self
                .description
                .clone()
                .map(PropertyValue::Text)
                .unwrap_or(PropertyValue::Null),
            ("owner", _) => self
                .owner
                .as_ref()
                .map(|owner| PropertyValue::Text(owner.login.clone()))
                .unwrap_or(PropertyValue::Null),
            _ => PropertyValue::Null,
        };
        Ok(value)
    }

    /// Files as record file entries; names split at the last `.`
    pub fn record_files(&self) -> Vec<RecordFile> {
        self.files
            .values()
            .map(|file| {
                let (title, extension) = match file.filename.rsplit_once('.') {
                    Some((title, extension)) if !title.is_empty() => (title, extension),
                    _ => (file.filename.as_str(), ""),
                };
                RecordFile {
                    title: title.to_string(),
                    extension: extension.to_string(),
                    size: file.size,
                    source_url: file.raw_url.clone(),
                }
            })
            .collect()
    }
}

/// Source of gists
#[async_trait]
pub trait GistFeed: Send + Sync {
    async fn fetch(&self) -> Result<Vec<Gist>>;
}

/// Feed serving a fixed list, optionally read from a JSON file
#[derive(Debug, Clone, Default)]
pub struct StaticGistFeed {
    gists: Arc<tokio::sync::RwLock<Vec<Gist>>>,
}

impl StaticGistFeed {
    pub fn new(gists: Vec<Gist>) -> Self {
        Self {
            gists: Arc::new(tokio::sync::RwLock::new(gists)),
        }
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(Self::new(serde_json::from_str(&contents)?))
    }

    pub async fn replace(&self, gists: Vec<Gist>) {
        *self.gists.write().await = gists;
    }
}

#[async_trait]
impl GistFeed for StaticGistFeed {
    async fn fetch(&self) -> Result<Vec<Gist>> {
        Ok(self.gists.read().await.clone())
    }
}

struct Target {
    object_type: ObjectTypeId,
    class: ClassId,
}

impl Target {
    fn filter(&self) -> SearchFilter {
        SearchFilter::new().object_type(self.object_type).class(self.class)
    }
}

pub struct ImportGistsModule {
    feed: Option<Arc<dyn GistFeed>>,
}

impl ImportGistsModule {
    pub fn new(feed: Option<Arc<dyn GistFeed>>) -> Self {
        Self { feed }
    }

    /// Directive seeded for the recurring entry
    pub fn directive() -> EmptyDirective {
        EmptyDirective {
            display_name: Some("Import gists".into()),
        }
    }

    fn properties(config: &ImportGistsConfig, gist: &Gist) -> Result<BTreeMap<PropertyId, PropertyValue>> {
        let mut properties = BTreeMap::new();
        if let Some(property) = config.url_property {
            properties.insert(property, PropertyValue::Text(gist.url.clone()));
        }
        for (column, property) in &config.field_properties {
            properties.insert(*property, gist.column(column)?);
        }
        Ok(properties)
    }

    /// Insert or update one gist; false if the existing record was skipped
    async fn upsert(
        repository: &Arc<dyn Repository>,
        target: &Target,
        config: &ImportGistsConfig,
        actor: &str,
        gist: &Gist,
    ) -> Result<bool> {
        let properties = Self::properties(config, gist)?;
        let existing = repository
            .search(&target.filter().external_id(gist.id.clone()), PageRequest::first(1))
            .await?
            .into_iter()
            .next();

        match existing {
            Some(record) if record.is_checked_out() => {
                warn!(
                    record = %record.reference,
                    gist = %gist.id,
                    holder = record.checked_out_to.as_deref().unwrap_or_default(),
                    "Gist record is checked out; skipping update"
                );
                Ok(false)
            }
            Some(record) => {
                let mut changes = PropertyChanges::new()
                    .class(target.class)
                    .title(gist.node_id.clone())
                    .files(gist.record_files());
                for (property, value) in properties {
                    changes = changes.set(property, value);
                }
                let handle = repository.lock(&record.reference, actor).await?;
                let saved = repository.save_properties(&handle, &changes).await;
                repository.unlock(handle).await?;
                saved?;
                debug!(record = %record.reference, gist = %gist.id, "Updated gist");
                Ok(true)
            }
            None => {
                let reference = repository
                    .create_record(NewRecord {
                        properties,
                        files: gist.record_files(),
                        external_id: Some(gist.id.clone()),
                        ..NewRecord::new(target.object_type, target.class, gist.node_id.clone())
                    })
                    .await?;
                debug!(record = %reference, gist = %gist.id, "Created gist");
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl AutomationModule for ImportGistsModule {
    fn name(&self) -> &str {
        "Import gists"
    }

    fn processors(self: Arc<Self>) -> Vec<Arc<dyn TaskProcessor>> {
        vec![self]
    }
}

#[async_trait]
impl TaskProcessor for ImportGistsModule {
    fn task_type(&self) -> &str {
        TASK_TYPE
    }

    fn transaction_mode(&self) -> TransactionMode {
        TransactionMode::Full
    }

    async fn process(&self, job: &mut TaskJob) -> JobResult {
        let config = job.config().import_gists.clone();
        if !config.enabled {
            debug!("Gist import is disabled in configuration; skipping run");
            return Ok(());
        }
        let Some(feed) = &self.feed else {
            error!("No gist feed is configured");
            return Err(JobError::fatal("no gist feed is configured"));
        };
        let (Some(object_type), Some(class)) = (config.target_object_type, config.target_class) else {
            return Err(AutomationError::Configuration(
                "Gist import needs a target object type and class".into(),
            )
            .into());
        };
        let target = Target { object_type, class };

        let gists = feed.fetch().await.map_err(|e| {
            warn!(error = %e, "Could not read gist feed");
            JobError::requeue(format!("could not read gist feed: {}", e))
        })?;

        let repository = job.repository().clone();
        let actor = job.config().queue.lock_actor.clone();
        let mut imported = 0;
        for gist in &gists {
            job.throw_if_cancelled()?;
            if Self::upsert(&repository, &target, &config, &actor, gist).await? {
                imported += 1;
            }
            job.report_progress(format!("Imported {} of {}", imported, gists.len()))
                .await?;
        }

        let current: HashSet<&str> = gists.iter().map(|gist| gist.id.as_str()).collect();
        let mut stale: Vec<RecordRef> = Vec::new();
        let mut iterator = SegmentedIterator::new(repository.clone(), target.filter(), job.signal());
        while let Some(record) = iterator.next().await? {
            let listed = record
                .external_id
                .as_deref()
                .map(|id| current.contains(id))
                .unwrap_or(false);
            if !listed {
                stale.push(record.reference);
            }
        }
        let mut removed = 0;
        for reference in stale {
            match repository.destroy_record(&reference).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(record = %reference, error = %e, "Could not remove stale gist"),
            }
        }

        info!(imported, removed, total = gists.len(), "Gist import finished");
        Ok(())
    }
}
