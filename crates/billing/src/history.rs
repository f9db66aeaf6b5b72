//! Subscription audit history
//!
//! Append-only log of every lifecycle transition and dunning action, for
//! support and compliance. Entries are never updated or deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who performed an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum Actor {
    System,
    User(Uuid),
    Admin(Uuid),
}

impl Actor {
    pub fn kind(&self) -> &'static str {
        match self {
            Actor::System => "system",
            Actor::User(_) => "user",
            Actor::Admin(_) => "admin",
        }
    }

    pub fn id(&self) -> Option<Uuid> {
        match self {
            Actor::System => None,
            Actor::User(id) | Actor::Admin(id) => Some(*id),
        }
    }
}

/// Audited subscription actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Created,
    Renewed,
    PaymentFailed,
    DunningLevelAdvanced,
    CancelledByDunning,
    Paused,
    Resumed,
    Cancelled,
    CreditPending,
    CreditReconciled,
    Refunded,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Created => "created",
            HistoryAction::Renewed => "renewed",
            HistoryAction::PaymentFailed => "payment_failed",
            HistoryAction::DunningLevelAdvanced => "dunning_level_advanced",
            HistoryAction::CancelledByDunning => "cancelled_by_dunning",
            HistoryAction::Paused => "paused",
            HistoryAction::Resumed => "resumed",
            HistoryAction::Cancelled => "cancelled",
            HistoryAction::CreditPending => "credit_pending",
            HistoryAction::CreditReconciled => "credit_reconciled",
            HistoryAction::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub action: HistoryAction,
    pub note: String,
    pub actor: Actor,
    /// Structured context for debugging (invoice ids, amounts, levels)
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(
        subscription_id: Uuid,
        action: HistoryAction,
        note: impl Into<String>,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            action,
            note: note.into(),
            actor,
            context: serde_json::json!({}),
            created_at: at,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}
