//! Payment attempt log
//!
//! Append-only record of logical payment attempts per invoice. Attempt
//! numbers are allocated by the store and strictly increase; recording a
//! new attempt abandons any still-open scheduled/in-progress row so at
//! most one attempt per invoice is ever open.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payment attempt status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Scheduled,
    InProgress,
    Succeeded,
    Failed,
    Abandoned,
}

impl RetryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStatus::Scheduled => "scheduled",
            RetryStatus::InProgress => "in_progress",
            RetryStatus::Succeeded => "succeeded",
            RetryStatus::Failed => "failed",
            RetryStatus::Abandoned => "abandoned",
        }
    }

    pub fn from_str_or_abandoned(s: &str) -> Self {
        match s {
            "scheduled" => RetryStatus::Scheduled,
            "in_progress" => RetryStatus::InProgress,
            "succeeded" => RetryStatus::Succeeded,
            "failed" => RetryStatus::Failed,
            _ => RetryStatus::Abandoned,
        }
    }

    /// Whether this attempt still awaits an outcome
    pub fn is_open(&self) -> bool {
        matches!(self, RetryStatus::Scheduled | RetryStatus::InProgress)
    }
}

impl std::fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One logical payment attempt against an invoice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRetry {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub invoice_id: Uuid,
    pub attempt_number: i32,
    pub status: RetryStatus,
    pub scheduled_at: DateTime<Utc>,
}
