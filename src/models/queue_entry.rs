// Queue entries, delivery states and retry policy

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution envelope of a task type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionMode {
    /// Timed, all-or-nothing: the handler runs inside one repository transaction
    Full,
    /// Untimed, no enclosing transaction; the handler must be resumable
    Unsafe,
}

/// Delivery state of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    InProgress,
    Done,
    Failed,
    Cancelled,
}

impl EntryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryState::Done | EntryState::Failed | EntryState::Cancelled)
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            EntryState::Pending => "pending",
            EntryState::InProgress => "in_progress",
            EntryState::Done => "done",
            EntryState::Failed => "failed",
            EntryState::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for EntryState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EntryState::Pending),
            "in_progress" => Ok(EntryState::InProgress),
            "done" => Ok(EntryState::Done),
            "failed" => Ok(EntryState::Failed),
            "cancelled" => Ok(EntryState::Cancelled),
            other => Err(format!("unknown entry state '{}'", other)),
        }
    }
}

/// A task directive stored in the queue together with its delivery bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    /// Insertion order, assigned by the store
    #[serde(default)]
    pub sequence: u64,
    pub queue_id: String,
    pub task_type: String,
    pub mode: TransactionMode,
    pub directive: serde_json::Value,
    #[serde(default)]
    pub display_name: Option<String>,
    pub state: EntryState,
    /// Number of deliveries started so far
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Interval after which a successor entry is scheduled
    #[serde(default)]
    pub recurrence_secs: Option<u64>,
}

impl QueueEntry {
    pub fn new(
        queue_id: impl Into<String>,
        task_type: impl Into<String>,
        mode: TransactionMode,
        directive: serde_json::Value,
        display_name: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            queue_id: queue_id.into(),
            task_type: task_type.into(),
            mode,
            directive,
            display_name,
            state: EntryState::Pending,
            attempts: 0,
            progress: None,
            last_error: None,
            enqueued_at: now,
            available_at: now,
            started_at: None,
            finished_at: None,
            recurrence_secs: None,
        }
    }

    /// Delay the first delivery
    pub fn available_after(mut self, delay: Duration) -> Self {
        self.available_at = Utc::now() + chrono_delay(delay);
        self
    }

    pub fn recurring(mut self, interval: Duration) -> Self {
        self.recurrence_secs = Some(interval.as_secs().max(1));
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == EntryState::Pending && self.available_at <= now
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.queue_id, &self.task_type)
    }

    /// Label used in logs
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.task_type)
    }
}

pub(crate) fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Backoff strategy between redeliveries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear { increment_ms: u64 },
    Exponential { multiplier: f64 },
}

/// Queue-level redelivery policy for `Requeue` outcomes and timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// `None` retries forever
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
            initial_delay_ms: 5_000,
            max_delay_ms: 600_000,
            backoff: BackoffStrategy::Exponential { multiplier: 2.0 },
        }
    }
}

impl RetryPolicy {
    /// Policy without delays, handy for inline processing
    pub fn immediate(max_attempts: Option<u32>) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff: BackoffStrategy::Fixed,
        }
    }

    /// Whether another delivery is allowed after `attempts` deliveries
    pub fn allows_retry(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }

    /// Delay before the delivery following attempt number `attempts` (1-based)
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let step = attempts.saturating_sub(1);
        let delay_ms = match &self.backoff {
            BackoffStrategy::Fixed => self.initial_delay_ms as f64,
            BackoffStrategy::Linear { increment_ms } => {
                self.initial_delay_ms as f64 + (*increment_ms as f64) * step as f64
            }
            BackoffStrategy::Exponential { multiplier } => {
                self.initial_delay_ms as f64 * multiplier.powi(step.min(64) as i32)
            }
        };
        let capped = delay_ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for(30), Duration::from_secs(600));
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy {
            max_attempts: None,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff: BackoffStrategy::Linear { increment_ms: 500 },
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2_000));
    }

    #[test]
    fn test_retry_cap() {
        let policy = RetryPolicy::immediate(Some(3));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
        assert!(RetryPolicy::immediate(None).allows_retry(u32::MAX));
    }

    #[test]
    fn test_entry_due_only_when_pending_and_available() {
        let entry = QueueEntry::new("q", "t", TransactionMode::Full, serde_json::json!({}), None);
        assert!(entry.is_due(Utc::now()));

        let delayed = entry.clone().available_after(Duration::from_secs(60));
        assert!(!delayed.is_due(Utc::now()));

        let mut done = entry;
        done.state = EntryState::Done;
        assert!(!done.is_due(Utc::now()));
    }

    #[test]
    fn test_state_round_trips_through_cli_names() {
        for state in [EntryState::Pending, EntryState::InProgress, EntryState::Failed] {
            assert_eq!(state.to_string().parse::<EntryState>().unwrap(), state);
        }
        assert!("bogus".parse::<EntryState>().is_err());
    }
}
