// Prerequisite checks: veto a commit until supporting records exist

//! # Ensure Prerequisites
//!
//! Rules name the records that must exist before a record can be saved, e.g.
//! "an employee needs at least one signed contract referencing them". Each rule
//! has triggers selecting the records it applies to and count conditions
//! describing the required supporting records. The first failing condition
//! vetoes the commit with the condition's configured message.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{AutomationModule, CommitContext};
use crate::models::{CountCondition, Rule};
use crate::{AutomationError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsurePrerequisitesConfig {
    pub enabled: bool,
    /// Rules whose actions are the count conditions to enforce
    pub rules: Vec<Rule<CountCondition>>,
}

#[derive(Debug, Default)]
pub struct EnsurePrerequisitesModule;

impl EnsurePrerequisitesModule {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AutomationModule for EnsurePrerequisitesModule {
    fn name(&self) -> &str {
        "Ensure prerequisite objects"
    }

    async fn before_commit_finalize(&self, ctx: &mut CommitContext) -> Result<()> {
        let config = &ctx.config.ensure_prerequisites;
        if !config.enabled {
            debug!("Prerequisite checking disabled in configuration");
            return Ok(());
        }

        let matching = ctx
            .evaluator()
            .find_matching_rules(&ctx.record, &config.rules)
            .await?;
        if matching.is_empty() {
            debug!(record = %ctx.record.reference, "No prerequisite rules match");
            return Ok(());
        }

        let matcher = ctx.matcher();
        for rule in matching {
            for condition in &rule.actions {
                if !matcher.matches_count(&ctx.record, condition).await? {
                    info!(
                        record = %ctx.record.reference,
                        rule = %rule.name,
                        condition = %condition.name,
                        "Prerequisite not met, rejecting change"
                    );
                    return Err(AutomationError::Validation(condition.exception_message.clone()));
                }
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
        ConditionType, PropertyValue, Record, RecordRef, SearchCondition, SearchFilter, Trigger,
    };
    use crate::modules::testing;
    use serde_json::json;
    use std::sync::Arc;

    const EMPLOYEE_TYPE: i32 = 102;
    const EMPLOYEE_CLASS: i32 = 5;
    const CONTRACT_CLASS: i32 = 4;
    const IS_SIGNED: i32 = 1101;
    const EMPLOYEE: i32 = 1100;

    fn config(condition_type: ConditionType) -> AutomationConfig {
        let mut config = AutomationConfig::default();
        config.ensure_prerequisites = EnsurePrerequisitesConfig {
            enabled: true,
            rules: vec![Rule::new("Employees need a signed contract")
                .with_trigger(Trigger::default().and(SearchCondition::new(
                    crate::models::Expression::Class,
                    ConditionType::Equal,
                    PropertyValue::Integer(EMPLOYEE_CLASS as i64),
                )))
                .with_action(
                    CountCondition::new(
                        "Signed contract",
                        SearchFilter::new()
                            .class(CONTRACT_CLASS)
                            .property_equals(IS_SIGNED, PropertyValue::Boolean(true)),
                    )
                    .comparing(condition_type, 1)
                    .with_message("The employee must have a signed contract."),
                )],
        };
        config
    }

    async fn setup(signed: usize) -> (Arc<InMemoryRepository>, Record) {
        let repository = Arc::new(InMemoryRepository::new());
        let employee = Record::new(RecordRef::new(EMPLOYEE_TYPE, 1), EMPLOYEE_CLASS, "Jane Doe");
        repository.insert_record(employee.clone()).await;
        for id in 1..=signed as i64 {
            repository
                .insert_record(
                    Record::new(RecordRef::new(0, id), CONTRACT_CLASS, "Contract")
                        .with_property(IS_SIGNED, PropertyValue::Boolean(true))
                        .with_property(EMPLOYEE, PropertyValue::Lookup(employee.reference)),
                )
                .await;
        }
        (repository, employee)
    }

    async fn check(signed: usize, condition_type: ConditionType) -> Result<()> {
        let (repository, employee) = setup(signed).await;
        let config = config(condition_type);
        let queue = testing::queue(repository.clone(), &config);
        let mut ctx = testing::context(employee, None, repository, config, queue);
        EnsurePrerequisitesModule::new().before_commit_finalize(&mut ctx).await
    }

    #[tokio::test]
    async fn test_missing_contract_vetoes_with_message() {
        let err = check(0, ConditionType::GreaterThanOrEqual).await.unwrap_err();
        assert!(matches!(err, AutomationError::Validation(_)));
        assert_eq!(err.to_string(), "The employee must have a signed contract.");
    }

    #[tokio::test]
    async fn test_one_contract_passes() {
        check(1, ConditionType::GreaterThanOrEqual).await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_comparator_is_a_configuration_error() {
        let err = check(1, ConditionType::Contains).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("not supported for numerical comparisons"));
    }

    #[tokio::test]
    async fn test_records_outside_the_trigger_are_ignored() {
        let repository = Arc::new(InMemoryRepository::new());
        let contract = Record::new(RecordRef::new(0, 50), CONTRACT_CLASS, "Unrelated");
        let config = config(ConditionType::GreaterThanOrEqual);
        let queue = testing::queue(repository.clone(), &config);
        let mut ctx = testing::context(contract, None, repository, config, queue);

        EnsurePrerequisitesModule::new()
            .before_commit_finalize(&mut ctx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_disabled_module_does_nothing() {
        let (repository, employee) = setup(0).await;
        let mut config = config(ConditionType::GreaterThanOrEqual);
        config.ensure_prerequisites.enabled = false;
        let queue = testing::queue(repository.clone(), &config);
        let mut ctx = testing::context(employee, None, repository, config, queue);

        EnsurePrerequisitesModule::new()
            .before_commit_finalize(&mut ctx)
            .await
            .unwrap();
    }

    #[test]
    fn test_rules_deserialize_with_conditions_key() {
        let config: EnsurePrerequisitesConfig = serde_json::from_value(json!({
            "enabled": true,
            "rules": [{
                "name": "Signed contract",
                "triggers": [{ "conditions": [] }],
                "conditions": [{
                    "name": "contract",
                    "condition_type": "GreaterThanOrEqual",
                    "exception_message": "Needs a contract"
                }]
            }]
        }))
        .unwrap();

        let condition = &config.rules[0].actions[0];
        assert_eq!(condition.condition_type, ConditionType::GreaterThanOrEqual);
        assert_eq!(condition.value, 1);
        assert_eq!(condition.exception_message, "Needs a contract");
    }
}
