// Declarative conditions evaluated against records

use serde::{Deserialize, Serialize};

use super::search::{ConditionType, SearchCondition, SearchFilter};

/// A predicate over one record
///
/// Property conditions are answered from the record's loaded properties.
/// Count conditions ask the repository how many records matching a sub-query
/// reference the record, then compare that count with a configured value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    Property(SearchCondition),
    RelatedCount(CountCondition),
}

impl From<SearchCondition> for Condition {
    fn from(condition: SearchCondition) -> Self {
        Condition::Property(condition)
    }
}

impl From<CountCondition> for Condition {
    fn from(condition: CountCondition) -> Self {
        Condition::RelatedCount(condition)
    }
}

/// "At least one signed contract references this employee" and similar checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountCondition {
    #[serde(default)]
    pub name: String,
    /// Sub-query applied to records that reference the evaluated record
    #[serde(default)]
    pub search: SearchFilter,
    #[serde(default)]
    pub condition_type: ConditionType,
    #[serde(default = "default_count_value")]
    pub value: i64,
    /// Shown to the user when a prerequisite check fails
    #[serde(default)]
    pub exception_message: String,
}

fn default_count_value() -> i64 {
    1
}

impl CountCondition {
    pub fn new(name: impl Into<String>, search: SearchFilter) -> Self {
        Self {
            name: name.into(),
            search,
            condition_type: ConditionType::Equal,
            value: default_count_value(),
            exception_message: String::new(),
        }
    }

    pub fn comparing(mut self, condition_type: ConditionType, value: i64) -> Self {
        self.condition_type = condition_type;
        self.value = value;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.exception_message = message.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_condition_defaults() {
        let condition: CountCondition = serde_json::from_value(serde_json::json!({
            "name": "Signed contract",
            "exception_message": "A signed contract is required."
        }))
        .unwrap();

        assert_eq!(condition.condition_type, ConditionType::Equal);
        assert_eq!(condition.value, 1);
        assert!(condition.search.conditions.is_empty());
    }

    #[test]
    fn test_condition_is_tagged() {
        let condition: Condition = serde_json::from_value(serde_json::json!({
            "kind": "related_count",
            "name": "Any",
            "condition_type": "GreaterThanOrEqual"
        }))
        .unwrap();

        match condition {
            Condition::RelatedCount(count) => {
                assert_eq!(count.condition_type, ConditionType::GreaterThanOrEqual)
            }
            other => panic!("unexpected condition {:?}", other),
        }
    }
}
