//! Inbound commerce events
//!
//! The storefront and payment capture live outside this engine; completed
//! and failed recurring orders arrive as these events. Delivery may be
//! duplicated or delayed, so every consumer treats them idempotently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How an event addresses the subscription it belongs to.
///
/// Renewal orders carry the subscription id; initial signup orders only
/// know the purchased plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionRef {
    Id(Uuid),
    PlanKey(String),
}

/// A recurring order was captured successfully
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPaid {
    pub subscription: SubscriptionRef,
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub tax_cents: i64,
    pub currency: String,
    pub paid_at: DateTime<Utc>,
    pub payment_method: Option<String>,
    pub gateway_transaction_id: Option<String>,
    pub order_ref: String,
}

/// A recurring order's payment attempt failed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFailed {
    pub subscription: SubscriptionRef,
    pub user_id: Uuid,
    pub order_ref: String,
    /// When the failed attempt happened; used to discard attempts that a
    /// later successful payment already superseded
    pub occurred_at: DateTime<Utc>,
}

/// Operator- or customer-initiated lifecycle action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualActionKind {
    Pause,
    Resume,
    Cancel,
}

impl ManualActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManualActionKind::Pause => "pause",
            ManualActionKind::Resume => "resume",
            ManualActionKind::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualAction {
    pub subscription_id: Uuid,
    pub action: ManualActionKind,
    pub actor_id: Uuid,
}
