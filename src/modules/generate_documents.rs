// Document generation from templates

//! # Generate Documents
//!
//! When a committed record matches a rule, every action of the rule copies a
//! source record (a document template or any record named by type and id). The
//! copy keeps class, title, properties and files, loses the template flag and
//! can reference the triggering record through the trigger type's default
//! property.
//!
//! Copies are created through the commit's transaction, so a veto by a later
//! hook removes them again.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{AutomationModule, CommitContext};
use crate::engine::Repository;
use crate::models::{
    builtin, NewRecord, ObjectTypeId, PropertyValue, Record, RecordRef, Rule, UserId,
};
use crate::{AutomationError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateDocumentsConfig {
    pub enabled: bool,
    pub rules: Vec<Rule<GenerateDocumentAction>>,
}

fn relate_by_default() -> bool {
    true
}

/// What to copy when a rule matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerateDocumentAction {
    /// Copy a document template by id
    CopyTemplate {
        template: i64,
        #[serde(default = "relate_by_default")]
        relate_to_trigger: bool,
    },
    /// Copy any record by type and id
    CopyRecord {
        object_type: ObjectTypeId,
        id: i64,
        #[serde(default = "relate_by_default")]
        relate_to_trigger: bool,
    },
}

impl GenerateDocumentAction {
    pub fn source(&self) -> RecordRef {
        match self {
            GenerateDocumentAction::CopyTemplate { template, .. } => {
                RecordRef::new(builtin::DOCUMENT_OBJECT_TYPE, *template)
            }
            GenerateDocumentAction::CopyRecord { object_type, id, .. } => RecordRef::new(*object_type, *id),
        }
    }

    pub fn relate_to_trigger(&self) -> bool {
        match self {
            GenerateDocumentAction::CopyTemplate { relate_to_trigger, .. }
            | GenerateDocumentAction::CopyRecord { relate_to_trigger, .. } => *relate_to_trigger,
        }
    }
}

#[derive(Debug, Default)]
pub struct GenerateDocumentsModule;

impl GenerateDocumentsModule {
    pub fn new() -> Self {
        Self
    }

    async fn generate(
        repository: &dyn Repository,
        trigger: &Record,
        action: &GenerateDocumentAction,
        user: UserId,
    ) -> Result<RecordRef> {
        let source = repository.get_record(&action.source()).await?.ok_or_else(|| {
            error!(source = %action.source(), "Could not load configured source object");
            AutomationError::Configuration(format!(
                "Could not find a source object to copy; the configuration is invalid: {}",
                serde_json::to_string(action).unwrap_or_else(|_| format!("{:?}", action))
            ))
        })?;

        let mut copy = NewRecord {
            properties: source.properties.clone(),
            files: source.files.clone(),
            created_by: Some(user),
            comment: Some("Generated automatically".into()),
            ..NewRecord::new(source.reference.object_type, source.class, source.title.clone())
        };
        copy.properties.remove(&builtin::IS_TEMPLATE_PROPERTY);

        if action.relate_to_trigger() {
            let object_type = repository
                .object_type(trigger.reference.object_type)
                .await?
                .ok_or_else(|| {
                    AutomationError::Configuration(format!(
                        "object type {} is not known, cannot relate generated documents to it",
                        trigger.reference.object_type
                    ))
                })?;
            debug!(
                property = object_type.default_property,
                trigger = %trigger.reference,
                "Relating generated document to trigger"
            );
            let mut related: Vec<RecordRef> = copy
                .properties
                .get(&object_type.default_property)
                .map(|value| value.lookups().to_vec())
                .unwrap_or_default();
            if !related.contains(&trigger.reference) {
                related.push(trigger.reference);
            }
            copy.properties
                .insert(object_type.default_property, PropertyValue::MultiLookup(related));
        }

        repository.create_record(copy).await
    }
}

#[async_trait]
impl AutomationModule for GenerateDocumentsModule {
    fn name(&self) -> &str {
        "Generate documents on demand"
    }

    async fn before_commit_finalize(&self, ctx: &mut CommitContext) -> Result<()> {
        let config = &ctx.config.generate_documents;
        if !config.enabled {
            debug!("Document generation skipped; disabled in configuration");
            return Ok(());
        }

        let rules = ctx
            .evaluator()
            .find_matching_rules(&ctx.record, &config.rules)
            .await?;
        if rules.is_empty() {
            debug!(record = %ctx.record.reference, "Document generation skipped; no matching rules");
            return Ok(());
        }

        for rule in rules {
            for action in &rule.actions {
                let created =
                    Self::generate(ctx.repository.as_ref(), &ctx.record, action, ctx.user).await?;
                info!(
                    rule = %rule.name,
                    trigger = %ctx.record.reference,
                    created = %created,
                    "Generated document"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutomationConfig;
    use crate::engine::InMemoryRepository;
    use crate::models::{
        ConditionType, Expression, ObjectTypeInfo, RecordFile, SearchCondition, SearchFilter,
        Trigger,
    };
    use crate::modules::testing;
    use serde_json::json;
    use std::sync::Arc;

    const PROJECT_TYPE: ObjectTypeId = 101;
    const PROJECT_PROPERTY: i32 = 1050;
    const PROJECT_CLASS: i32 = 3;

    fn config(actions: Vec<GenerateDocumentAction>) -> AutomationConfig {
        let mut config = AutomationConfig::default();
        let mut rule = Rule::new("Project kick-off documents").with_trigger(Trigger::default().and(
            SearchCondition::new(
                Expression::Class,
                ConditionType::Equal,
                PropertyValue::Integer(PROJECT_CLASS as i64),
            ),
        ));
        rule.actions = actions;
        config.generate_documents = GenerateDocumentsConfig {
            enabled: true,
            rules: vec![rule],
        };
        config
    }

    async fn repository() -> Arc<InMemoryRepository> {
        let repository = Arc::new(InMemoryRepository::new());
        repository
            .register_object_type(ObjectTypeInfo {
                id: PROJECT_TYPE,
                name: "Project".into(),
                default_property: PROJECT_PROPERTY,
                can_have_files: false,
            })
            .await;
        repository
            .insert_record(
                Record::new(RecordRef::new(0, 500), 8, "Kick-off checklist")
                    .with_property(builtin::IS_TEMPLATE_PROPERTY, PropertyValue::Boolean(true))
                    .with_property(1, PropertyValue::Text("draft".into()))
                    .with_file(RecordFile {
                        title: "checklist".into(),
                        extension: "docx".into(),
                        size: 2048,
                        source_url: None,
                    }),
            )
            .await;
        repository
    }

    fn project() -> Record {
        Record::new(RecordRef::new(PROJECT_TYPE, 1), PROJECT_CLASS, "Apollo")
    }

    async fn run(config: AutomationConfig, repository: Arc<InMemoryRepository>, record: Record) -> Result<()> {
        let queue = testing::queue(repository.clone(), &config);
        let mut ctx = testing::context(record, None, repository, config, queue);
        GenerateDocumentsModule::new().before_commit_finalize(&mut ctx).await
    }

    async fn generated(repository: &InMemoryRepository) -> Vec<Record> {
        repository
            .records()
            .await
            .into_iter()
            .filter(|record| record.reference.object_type == 0 && record.reference.id != 500)
            .collect()
    }

    #[tokio::test]
    async fn test_template_copy_is_related_to_trigger() {
        let repository = repository().await;
        let config = config(vec![GenerateDocumentAction::CopyTemplate {
            template: 500,
            relate_to_trigger: true,
        }]);

        run(config, repository.clone(), project()).await.unwrap();

        let copies = generated(&repository).await;
        assert_eq!(copies.len(), 1);
        let copy = &copies[0];
        assert_eq!(copy.title, "Kick-off checklist");
        assert_eq!(copy.class, 8);
        assert_eq!(copy.property(builtin::IS_TEMPLATE_PROPERTY), None);
        assert_eq!(copy.property(1), Some(&PropertyValue::Text("draft".into())));
        assert_eq!(copy.files.len(), 1);
        assert_eq!(copy.version_comment.as_deref(), Some("Generated automatically"));
        assert_eq!(copy.modified_by, Some(7));
        assert_eq!(
            copy.property(PROJECT_PROPERTY),
            Some(&PropertyValue::MultiLookup(vec![project().reference]))
        );
        assert!(SearchFilter::new().references(project().reference).matches(copy));
    }

    #[tokio::test]
    async fn test_copy_without_relationship() {
        let repository = repository().await;
        let config = config(vec![GenerateDocumentAction::CopyRecord {
            object_type: 0,
            id: 500,
            relate_to_trigger: false,
        }]);

        run(config, repository.clone(), project()).await.unwrap();

        let copies = generated(&repository).await;
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].property(PROJECT_PROPERTY), None);
    }

    #[tokio::test]
    async fn test_missing_source_is_a_configuration_error() {
        let repository = repository().await;
        let config = config(vec![GenerateDocumentAction::CopyTemplate {
            template: 999,
            relate_to_trigger: true,
        }]);

        let err = run(config, repository.clone(), project()).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("999"));
        assert!(generated(&repository).await.is_empty());
    }

    #[tokio::test]
    async fn test_non_matching_record_generates_nothing() {
        let repository = repository().await;
        let config = config(vec![GenerateDocumentAction::CopyTemplate {
            template: 500,
            relate_to_trigger: true,
        }]);
        let other = Record::new(RecordRef::new(PROJECT_TYPE, 2), PROJECT_CLASS + 1, "Not a project");

        run(config, repository.clone(), other).await.unwrap();
        assert!(generated(&repository).await.is_empty());
    }

    #[test]
    fn test_actions_deserialize_with_relationship_default() {
        let actions: Vec<GenerateDocumentAction> = serde_json::from_value(json!([
            { "type": "copy_template", "template": 500 },
            { "type": "copy_record", "object_type": 101, "id": 4, "relate_to_trigger": false }
        ]))
        .unwrap();
        assert!(actions[0].relate_to_trigger());
        assert_eq!(actions[1].source(), RecordRef::new(101, 4));
        assert!(!actions[1].relate_to_trigger());
    }
}
