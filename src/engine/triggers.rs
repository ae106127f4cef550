// Trigger evaluation: selecting the rules that apply to a record

//! # Trigger Evaluator
//!
//! Rules are OR-of-ANDs. For each rule, triggers are tried in order and the
//! first fully satisfied trigger selects the rule; inside a trigger the first
//! failing condition rejects it. Every matching rule is returned, in
//! configuration order, so several independent automations can react to the
//! same change.
//!
//! ## Rust Learning Notes:
//!
//! ### Lifetime Parameters
//! `find_matching_rules` returns references into the caller's rule slice, so
//! the result carries the slice's lifetime `'r` and no rule is cloned.

use tracing::debug;

use super::matcher::ConditionMatcher;
use crate::models::{Record, Trigger, Triggered};
use crate::Result;

/// Selects the rules whose triggers match a record
#[derive(Clone)]
pub struct TriggerEvaluator {
    matcher: ConditionMatcher,
}

impl TriggerEvaluator {
    pub fn new(matcher: ConditionMatcher) -> Self {
        Self { matcher }
    }

    /// All rules with at least one satisfied trigger, in the given order
    pub async fn find_matching_rules<'r, R: Triggered>(
        &self,
        record: &Record,
        rules: &'r [R],
    ) -> Result<Vec<&'r R>> {
        let mut matching = Vec::new();
        for rule in rules {
            if self.matches_any(record, rule.triggers()).await? {
                debug!(record = %record.reference, rule = rule.name(), "Rule matched");
                matching.push(rule);
            }
        }
        Ok(matching)
    }

    /// Whether any trigger in `triggers` is satisfied; no triggers never match
    pub async fn matches_any(&self, record: &Record, triggers: &[Trigger]) -> Result<bool> {
        for trigger in triggers {
            if self.matches_trigger(record, trigger).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether every condition of `trigger` holds
    pub async fn matches_trigger(&self, record: &Record, trigger: &Trigger) -> Result<bool> {
        for condition in &trigger.conditions {
            if !self.matcher.matches(record, condition).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
