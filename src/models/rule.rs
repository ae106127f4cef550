// Rule definitions for trigger-based automation

//! # Triggers and Rules
//!
//! Rules are expressed as an OR of ANDs:
//!
//! - A [`Trigger`] is an ordered list of [`Condition`]s; a record matches the
//!   trigger when it satisfies every condition.
//! - A [`Rule`] is a list of triggers plus the actions to run; a record matches
//!   the rule when it matches at least one trigger.
//!
//! `Rule` is generic over its action type so each automation keeps its own
//! strongly typed actions while sharing the matching logic.
//!
//! ## Rust Learning Notes:
//!
//! ### Generic Structs with Serde
//! `Rule<A>` derives `Serialize`/`Deserialize`; serde adds the matching bounds
//! on `A` automatically, so `Rule<CountCondition>` deserializes whenever
//! `CountCondition` does.

use serde::{Deserialize, Serialize};

use super::condition::Condition;

/// AND-group of conditions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Trigger {
    pub fn new(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    /// Builder-style helper for adding a condition
    pub fn and(mut self, condition: impl Into<Condition>) -> Self {
        self.conditions.push(condition.into());
        self
    }
}

/// OR-group of triggers plus the actions to run when any of them matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule<A> {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default = "Vec::new", alias = "conditions")]
    pub actions: Vec<A>,
}

impl<A> Rule<A> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            triggers: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn with_action(mut self, action: A) -> Self {
        self.actions.push(action);
        self
    }
}

/// Anything that carries triggers and can be selected by the trigger evaluator
pub trait Triggered {
    fn name(&self) -> &str;
    fn triggers(&self) -> &[Trigger];
}

impl<A> Triggered for Rule<A> {
    fn name(&self) -> &str {
        &self.name
    }

    fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }
}
