// Shared link issuance when records enter a workflow state

//! # Shared Links
//!
//! When a record enters a workflow state that has an enabled
//! [`SharedLinkTrigger`], a shared link to its single file is created, the link
//! URL is written into the trigger's target property of the version being
//! committed, and the link is sent to the recipients listed on the record.
//!
//! The link points at the latest committed version, which is the one holding
//! the file contents. Problems are logged and never stop the commit.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use url::Url;
use uuid::Uuid;

use super::{AutomationModule, CommitContext};
use crate::engine::SharedLinkRequest;
use crate::models::{PropertyId, PropertyValue, StateId};
use crate::{AutomationError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedLinksConfig {
    pub enabled: bool,
    /// Web address the link page is served under
    pub base_url: String,
    /// Links follow the latest version unless this is set
    pub use_version_dependent_links: bool,
    pub triggers: Vec<SharedLinkTrigger>,
}

impl Default for SharedLinksConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost/".into(),
            use_version_dependent_links: false,
            triggers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedLinkTrigger {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub trigger_state: StateId,
    #[serde(default)]
    pub expiry_property: Option<PropertyId>,
    #[serde(default)]
    pub description_property: Option<PropertyId>,
    #[serde(default)]
    pub target_property: Option<PropertyId>,
    #[serde(default)]
    pub recipients_property: Option<PropertyId>,
}

fn enabled_by_default() -> bool {
    true
}

/// Message handed to a [`LinkNotifier`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkNotification {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// Delivery of shared links to people
#[async_trait]
pub trait LinkNotifier: Send + Sync {
    async fn notify(&self, notification: &LinkNotification) -> Result<()>;
}

/// Keeps notifications in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<LinkNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<LinkNotification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl LinkNotifier for RecordingNotifier {
    async fn notify(&self, notification: &LinkNotification) -> Result<()> {
        info!(recipients = ?notification.recipients, subject = %notification.subject, "Recorded link notification");
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}

/// Address of the download page for an access key
pub fn link_url(base_url: &str, access_key: &str, vault_id: Uuid) -> Result<Url> {
    let mut url = Url::parse(base_url)
        .map_err(|e| AutomationError::Configuration(format!("invalid shared link base URL '{}': {}", base_url, e)))?;
    url.path_segments_mut()
        .map_err(|_| AutomationError::Configuration(format!("shared link base URL '{}' cannot have a path", base_url)))?
        .pop_if_empty()
        .push("SharedLinks.aspx");
    url.query_pairs_mut()
        .append_pair("accesskey", access_key)
        .append_pair("vaultguid", &format!("{{{}}}", vault_id.hyphenated()).to_uppercase());
    Ok(url)
}

/// Recipients separated by `,` or `;`
pub fn split_recipients(text: &str) -> Vec<String> {
    text.split([',', ';'])
        .map(str::trim)
        .filter(|recipient| !recipient.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct SharedLinksModule {
    notifier: Option<Arc<dyn LinkNotifier>>,
}

impl SharedLinksModule {
    pub fn new(notifier: Option<Arc<dyn LinkNotifier>>) -> Self {
        Self { notifier }
    }

    async fn issue(&self, ctx: &mut CommitContext, trigger: &SharedLinkTrigger) -> Result<Url> {
        let config = &ctx.config.shared_links;
        let committed = ctx.previous.as_ref().ok_or_else(|| {
            AutomationError::Validation("Shared links can only be created once a version has been committed.".into())
        })?;
        let [file] = committed.files.as_slice() else {
            return Err(AutomationError::Validation(
                "Shared links can only be created to single-file-documents.".into(),
            ));
        };

        let expires_at = trigger
            .expiry_property
            .and_then(|property| match ctx.record.property(property) {
                Some(PropertyValue::Timestamp(at)) => Some(*at),
                _ => None,
            });
        let description = trigger
            .description_property
            .and_then(|property| ctx.record.property(property))
            .and_then(PropertyValue::as_text)
            .map(str::to_string);

        let link = ctx
            .repository
            .create_shared_link(SharedLinkRequest {
                record: committed.reference,
                file_name: file.file_name(),
                version_dependent: config.use_version_dependent_links,
                version: committed.version,
                expires_at,
                description,
            })
            .await?;
        let url = link_url(&config.base_url, &link.access_key, ctx.repository.vault_id())?;
        info!(record = %committed.reference, file = %link.file_name, "Created shared link");

        if let Some(property) = trigger.target_property {
            ctx.record
                .properties
                .insert(property, PropertyValue::Text(url.to_string()));
            ctx.record.modified_by = Some(ctx.user);
        }

        let recipients = trigger
            .recipients_property
            .and_then(|property| ctx.record.property(property))
            .and_then(PropertyValue::as_text)
            .map(split_recipients)
            .unwrap_or_default();
        match (&self.notifier, recipients.is_empty()) {
            (_, true) => debug!(record = %committed.reference, "No recipients for shared link"),
            (None, false) => debug!("No link notifier configured; recipients not notified"),
            (Some(notifier), false) => {
                notifier
                    .notify(&LinkNotification {
                        recipients,
                        subject: format!("Link to download {}", ctx.record.title),
                        body: url.to_string(),
                    })
                    .await?
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl AutomationModule for SharedLinksModule {
    fn name(&self) -> &str {
        "Create shared links"
    }

    async fn before_commit_finalize(&self, ctx: &mut CommitContext) -> Result<()> {
        let config = ctx.config.clone();
        if !config.shared_links.enabled || !ctx.is_entering_state() {
            return Ok(());
        }
        let Some(state) = ctx.record.state else {
            return Ok(());
        };
        let Some(trigger) = config
            .shared_links
            .triggers
            .iter()
            .find(|trigger| trigger.enabled && trigger.trigger_state == state)
        else {
            return Ok(());
        };

        if let Err(e) = self.issue(ctx, trigger).await {
            error!(record = %ctx.record.reference, state, error = %e, "Could not create shared link");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutomationConfig;
    use crate::engine::InMemoryRepository;
    use crate::models::{Record, RecordFile, RecordRef};
    use crate::modules::testing;
    use chrono::{TimeZone, Utc};

    const APPROVED: StateId = 11;
    const EXPIRY: PropertyId = 1400;
    const DESCRIPTION: PropertyId = 1401;
    const TARGET: PropertyId = 1402;
    const RECIPIENTS: PropertyId = 1403;

    fn config() -> AutomationConfig {
        let mut config = AutomationConfig::default();
        config.shared_links = SharedLinksConfig {
            enabled: true,
            base_url: "https://vault.example.com/".into(),
            use_version_dependent_links: false,
            triggers: vec![SharedLinkTrigger {
                enabled: true,
                trigger_state: APPROVED,
                expiry_property: Some(EXPIRY),
                description_property: Some(DESCRIPTION),
                target_property: Some(TARGET),
                recipients_property: Some(RECIPIENTS),
            }],
        };
        config
    }

    fn file(title: &str) -> RecordFile {
        RecordFile {
            title: title.into(),
            extension: "pdf".into(),
            size: 10,
            source_url: None,
        }
    }

    fn committed(files: &[&str]) -> Record {
        let mut record = Record::new(RecordRef::new(0, 1), 2, "Offer")
            .with_property(RECIPIENTS, PropertyValue::Text("a@example.com; b@example.com,,".into()));
        record.files = files.iter().map(|title| file(title)).collect();
        record
    }

    async fn run(previous: Record, current: Record) -> (Record, Arc<InMemoryRepository>, Arc<RecordingNotifier>) {
        let repository = Arc::new(InMemoryRepository::new());
        repository.insert_record(previous.clone()).await;
        let config = config();
        let queue = testing::queue(repository.clone(), &config);
        let notifier = Arc::new(RecordingNotifier::new());
        let module = SharedLinksModule::new(Some(notifier.clone()));
        let mut ctx = testing::context(current, Some(previous), repository.clone(), config, queue);

        module.before_commit_finalize(&mut ctx).await.unwrap();
        (ctx.record, repository, notifier)
    }

    #[tokio::test]
    async fn test_entering_state_creates_link_and_notifies() {
        let expiry = Utc.with_ymd_and_hms(2030, 1, 31, 0, 0, 0).unwrap();
        let previous = committed(&["offer"]);
        let current = previous
            .clone()
            .with_state(APPROVED)
            .with_property(EXPIRY, PropertyValue::Timestamp(expiry))
            .with_property(DESCRIPTION, PropertyValue::Text("Signed offer".into()));

        let (record, repository, notifier) = run(previous, current).await;

        let links = repository.shared_links().await;
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].file_name, "offer.pdf");
        assert_eq!(links[0].expires_at, Some(expiry));
        assert_eq!(links[0].description.as_deref(), Some("Signed offer"));

        let url = record.property(TARGET).and_then(PropertyValue::as_text).unwrap().to_string();
        assert!(url.starts_with("https://vault.example.com/SharedLinks.aspx?accesskey="));
        assert!(url.contains(&links[0].access_key));
        assert_eq!(record.modified_by, Some(7));

        let sent = notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipients, vec!["a@example.com", "b@example.com"]);
        assert_eq!(sent[0].subject, "Link to download Offer");
        assert_eq!(sent[0].body, url);
    }

    #[tokio::test]
    async fn test_multiple_files_are_logged_not_vetoed() {
        let previous = committed(&["offer", "appendix"]);
        let current = previous.clone().with_state(APPROVED);

        let (record, repository, notifier) = run(previous, current).await;
        assert!(repository.shared_links().await.is_empty());
        assert_eq!(record.property(TARGET), None);
        assert!(notifier.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_staying_in_state_does_nothing() {
        let previous = committed(&["offer"]).with_state(APPROVED);
        let current = previous.clone();

        let (_record, repository, _notifier) = run(previous, current).await;
        assert!(repository.shared_links().await.is_empty());
    }

    #[tokio::test]
    async fn test_other_state_does_nothing() {
        let previous = committed(&["offer"]);
        let current = previous.clone().with_state(APPROVED + 1);

        let (_record, repository, _notifier) = run(previous, current).await;
        assert!(repository.shared_links().await.is_empty());
    }

    #[test]
    fn test_link_url_without_trailing_slash() {
        let vault = Uuid::nil();
        let url = link_url("https://vault.example.com/portal", "abc", vault).unwrap();
        assert_eq!(
            url.as_str(),
            "https://vault.example.com/portal/SharedLinks.aspx?accesskey=abc&vaultguid=%7B00000000-0000-0000-0000-000000000000%7D"
        );
        assert!(link_url("not a url", "abc", vault).unwrap_err().is_configuration());
    }

    #[test]
    fn test_split_recipients() {
        assert_eq!(split_recipients(" a@x.io ;b@x.io,, c@x.io;"), vec!["a@x.io", "b@x.io", "c@x.io"]);
        assert!(split_recipients(";,").is_empty());
    }
}
