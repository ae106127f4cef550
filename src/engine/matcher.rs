// Condition matching against loaded records

use std::sync::Arc;

use tracing::debug;

use super::repository::Repository;
use crate::models::{Condition, CountCondition, Record};
use crate::Result;

/// Read-only predicate evaluation for [`Condition`]s
///
/// Property conditions are answered from the record alone. Count conditions
/// run a sub-query scoped to records referencing this record. The repository
/// handle is only ever read from, so one matcher can be shared by concurrent
/// evaluations.
#[derive(Clone)]
pub struct ConditionMatcher {
    repository: Arc<dyn Repository>,
}

impl ConditionMatcher {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    /// Whether `record` satisfies `condition`
    ///
    /// ## Errors
    /// - `UnsupportedComparator` / `Configuration` for count conditions that
    ///   cannot be compared numerically; these must reach the caller
    /// - Repository errors from the count query
    pub async fn matches(&self, record: &Record, condition: &Condition) -> Result<bool> {
        match condition {
            Condition::Property(search) => Ok(search.evaluate(record)),
            Condition::RelatedCount(count) => self.matches_count(record, count).await,
        }
    }

    pub async fn matches_count(&self, record: &Record, condition: &CountCondition) -> Result<bool> {
        let count = self
            .repository
            .related_count(&record.reference, &condition.search)
            .await?;
        let passed = condition.condition_type.compare_count(count, condition.value)?;
        debug!(
            record = %record.reference,
            condition = %condition.name,
            count,
            comparator = %condition.condition_type,
            value = condition.value,
            passed,
            "Evaluated count condition"
        );
        Ok(passed)
    }
}
