// Structured queries over record properties

//! # Search Filters
//!
//! A [`SearchFilter`] is a conjunction of [`SearchCondition`]s, each of which
//! compares one aspect of a record (a property, its class, its workflow state,
//! ...) against a value using a [`ConditionType`].
//!
//! The same evaluation runs in two places: the in-memory repository uses it to
//! execute searches, and the condition matcher uses it to test a record that is
//! already loaded. Both therefore agree on what "matches" means.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::record::{ClassId, ObjectTypeId, PropertyId, PropertyValue, Record, RecordRef, StateId};
use crate::{AutomationError, Result};

/// Comparison operator used by search conditions and count conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConditionType {
    #[default]
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    StartsWith,
}

impl ConditionType {
    /// Compare an actual property value with the expected one
    pub fn evaluate(&self, actual: &PropertyValue, expected: &PropertyValue) -> bool {
        match self {
            ConditionType::Equal => actual.matches(expected),
            ConditionType::NotEqual => !actual.matches(expected),
            ConditionType::GreaterThan => actual.compare(expected) == Some(Ordering::Greater),
            ConditionType::GreaterThanOrEqual => matches!(
                actual.compare(expected),
                Some(Ordering::Greater) | Some(Ordering::Equal)
            ),
            ConditionType::LessThan => actual.compare(expected) == Some(Ordering::Less),
            ConditionType::LessThanOrEqual => matches!(
                actual.compare(expected),
                Some(Ordering::Less) | Some(Ordering::Equal)
            ),
            ConditionType::Contains => match (actual, expected) {
                (PropertyValue::Text(a), PropertyValue::Text(b)) => {
                    a.to_lowercase().contains(&b.to_lowercase())
                }
                (value, PropertyValue::Lookup(reference)) => value.lookups().contains(reference),
                _ => false,
            },
            ConditionType::StartsWith => match (actual, expected) {
                (PropertyValue::Text(a), PropertyValue::Text(b)) => {
                    a.to_lowercase().starts_with(&b.to_lowercase())
                }
                _ => false,
            },
        }
    }

    /// Compare a related-record count against a configured value
    ///
    /// Only the six numeric comparators are meaningful here; anything else is a
    /// configuration error rather than a silent pass or fail.
    pub fn compare_count(&self, count: u64, value: i64) -> Result<bool> {
        if value < 0 {
            return Err(AutomationError::Configuration(format!(
                "count conditions need a non-negative value, got {}",
                value
            )));
        }
        let value = value as u64;
        match self {
            ConditionType::Equal => Ok(count == value),
            ConditionType::NotEqual => Ok(count != value),
            ConditionType::GreaterThan => Ok(count > value),
            ConditionType::GreaterThanOrEqual => Ok(count >= value),
            ConditionType::LessThan => Ok(count < value),
            ConditionType::LessThanOrEqual => Ok(count <= value),
            ConditionType::Contains | ConditionType::StartsWith => {
                Err(AutomationError::UnsupportedComparator(self.to_string()))
            }
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConditionType::Equal => "Equal",
            ConditionType::NotEqual => "NotEqual",
            ConditionType::GreaterThan => "GreaterThan",
            ConditionType::GreaterThanOrEqual => "GreaterThanOrEqual",
            ConditionType::LessThan => "LessThan",
            ConditionType::LessThanOrEqual => "LessThanOrEqual",
            ConditionType::Contains => "Contains",
            ConditionType::StartsWith => "StartsWith",
        };
        write!(f, "{}", name)
    }
}

/// The aspect of a record a search condition looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expression {
    Property { property: PropertyId },
    ObjectType,
    Class,
    RecordId,
    ExternalId,
    State,
    /// Any lookup property of the record, compared with `Contains`/`Equal`
    AnyLookup,
}

/// One comparison inside a filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCondition {
    pub expression: Expression,
    #[serde(default)]
    pub operator: ConditionType,
    #[serde(default = "null_value")]
    pub value: PropertyValue,
}

fn null_value() -> PropertyValue {
    PropertyValue::Null
}

impl SearchCondition {
    pub fn new(expression: Expression, operator: ConditionType, value: PropertyValue) -> Self {
        Self {
            expression,
            operator,
            value,
        }
    }

    pub fn property(property: PropertyId, operator: ConditionType, value: PropertyValue) -> Self {
        Self::new(Expression::Property { property }, operator, value)
    }

    /// Test this condition against a loaded record
    pub fn evaluate(&self, record: &Record) -> bool {
        let actual = match self.expression {
            Expression::Property { property } => {
                record.property(property).cloned().unwrap_or(PropertyValue::Null)
            }
            Expression::ObjectType => PropertyValue::Integer(record.reference.object_type as i64),
            Expression::Class => PropertyValue::Integer(record.class as i64),
            Expression::RecordId => PropertyValue::Integer(record.reference.id),
            Expression::ExternalId => record
                .external_id
                .clone()
                .map(PropertyValue::Text)
                .unwrap_or(PropertyValue::Null),
            Expression::State => record
                .state
                .map(|state| PropertyValue::Integer(state as i64))
                .unwrap_or(PropertyValue::Null),
            Expression::AnyLookup => {
                let references = self.value.lookups();
                let hit = references.iter().any(|target| record.references(target));
                return match self.operator {
                    ConditionType::NotEqual => !hit,
                    _ => hit,
                };
            }
        };
        self.operator.evaluate(&actual, &self.value)
    }
}

/// Conjunction of search conditions; an empty filter matches everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchFilter {
    pub conditions: Vec<SearchCondition>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, condition: SearchCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn object_type(self, object_type: ObjectTypeId) -> Self {
        self.with(SearchCondition::new(
            Expression::ObjectType,
            ConditionType::Equal,
            PropertyValue::Integer(object_type as i64),
        ))
    }

    pub fn class(self, class: ClassId) -> Self {
        self.with(SearchCondition::new(
            Expression::Class,
            ConditionType::Equal,
            PropertyValue::Integer(class as i64),
        ))
    }

    pub fn state(self, state: StateId) -> Self {
        self.with(SearchCondition::new(
            Expression::State,
            ConditionType::Equal,
            PropertyValue::Integer(state as i64),
        ))
    }

    pub fn property_equals(self, property: PropertyId, value: PropertyValue) -> Self {
        self.with(SearchCondition::property(property, ConditionType::Equal, value))
    }

    pub fn external_id(self, external_id: impl Into<String>) -> Self {
        self.with(SearchCondition::new(
            Expression::ExternalId,
            ConditionType::Equal,
            PropertyValue::Text(external_id.into()),
        ))
    }

    /// Restrict to records with a lookup pointing at `target`
    pub fn references(self, target: RecordRef) -> Self {
        self.with(SearchCondition::new(
            Expression::AnyLookup,
            ConditionType::Equal,
            PropertyValue::Lookup(target),
        ))
    }

    /// Test every condition against a loaded record
    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|condition| condition.evaluate(record))
    }
}
