//! Billing Invariants Module
//!
//! Runnable consistency checks for the billing engine, executed after
//! mutations or on a schedule to confirm the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write
//! 4. **Complete**: Covers the consistency rules the engine depends on

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Subscription(s) affected
    pub subscription_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - customers may be charged without getting points
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: DateTime<Utc>,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for duplicate live subscription violation
#[derive(Debug, sqlx::FromRow)]
struct DuplicateLiveRow {
    user_id: Uuid,
    plan_key: String,
    sub_count: i64,
}

/// Row type for duplicate paid period violation
#[derive(Debug, sqlx::FromRow)]
struct DuplicatePaidPeriodRow {
    subscription_id: Uuid,
    billing_period_start: DateTime<Utc>,
    paid_count: i64,
}

/// Row type for uncredited paid invoice violation
#[derive(Debug, sqlx::FromRow)]
struct UncreditedInvoiceRow {
    invoice_id: Uuid,
    subscription_id: Uuid,
    invoice_number: String,
    paid_at: Option<DateTime<Utc>>,
}

/// Row type for dunning-level bound violation
#[derive(Debug, sqlx::FromRow)]
struct DunningBoundsRow {
    subscription_id: Uuid,
    status: String,
    dunning_level: i16,
}

/// Row type for cancelled-without-history violation
#[derive(Debug, sqlx::FromRow)]
struct UnauditedCancelRow {
    subscription_id: Uuid,
    updated_at: DateTime<Utc>,
}

/// Row type for overdue-without-invoice violation
#[derive(Debug, sqlx::FromRow)]
struct OverdueNoInvoiceRow {
    subscription_id: Uuid,
    next_renewal_at: DateTime<Utc>,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = Utc::now();
        let mut violations = Vec::new();

        violations.extend(self.check_single_live_subscription().await?);
        violations.extend(self.check_one_paid_invoice_per_period().await?);
        violations.extend(self.check_paid_invoices_credited().await?);
        violations.extend(self.check_dunning_level_bounds().await?);
        violations.extend(self.check_cancelled_has_history().await?);
        violations.extend(self.check_overdue_has_invoice().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: At most 1 live subscription per (user, plan)
    ///
    /// Two live subscriptions for the same plan would double-bill and
    /// double-credit the wallet.
    async fn check_single_live_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateLiveRow> = sqlx::query_as(
            r#"
            SELECT user_id, plan_key, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status IN ('active', 'paused', 'overdue')
            GROUP BY user_id, plan_key
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_live_subscription".to_string(),
                subscription_ids: vec![],
                description: format!(
                    "User {} has {} live subscriptions for plan '{}' (expected 1)",
                    row.user_id, row.sub_count, row.plan_key
                ),
                context: serde_json::json!({
                    "user_id": row.user_id,
                    "plan_key": row.plan_key,
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: At most 1 paid invoice per (subscription, period)
    ///
    /// A second paid invoice for the same period means the customer was
    /// charged twice for one cycle.
    async fn check_one_paid_invoice_per_period(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicatePaidPeriodRow> = sqlx::query_as(
            r#"
            SELECT subscription_id, billing_period_start, COUNT(*) as paid_count
            FROM invoices
            WHERE status = 'paid'
            GROUP BY subscription_id, billing_period_start
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "one_paid_invoice_per_period".to_string(),
                subscription_ids: vec![row.subscription_id],
                description: format!(
                    "{} paid invoices for the period starting {}",
                    row.paid_count, row.billing_period_start
                ),
                context: serde_json::json!({
                    "billing_period_start": row.billing_period_start,
                    "paid_count": row.paid_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: Paid invoices are credited or flagged
    ///
    /// A paid invoice must have a wallet ledger entry, or carry the
    /// credit_pending flag so reconciliation picks it up. Anything else is
    /// a customer who paid and got nothing.
    async fn check_paid_invoices_credited(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UncreditedInvoiceRow> = sqlx::query_as(
            r#"
            SELECT i.id as invoice_id, i.subscription_id, i.invoice_number, i.paid_at
            FROM invoices i
            WHERE i.status = 'paid'
              AND i.credit_pending = false
              AND NOT EXISTS (
                  SELECT 1 FROM usage_tracking u
                  WHERE u.subscription_id = i.subscription_id
                    AND u.invoice_id = i.id
                    AND u.direction = 'credit'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_invoices_credited".to_string(),
                subscription_ids: vec![row.subscription_id],
                description: format!(
                    "Invoice {} is paid but has no wallet credit and no reconciliation flag",
                    row.invoice_number
                ),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "paid_at": row.paid_at,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: Dunning level stays in range and matches status
    ///
    /// Levels run 0-4, and a non-zero level only makes sense while the
    /// subscription is overdue (cancellation keeps the terminal level for
    /// audit).
    async fn check_dunning_level_bounds(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DunningBoundsRow> = sqlx::query_as(
            r#"
            SELECT id as subscription_id, status, dunning_level
            FROM subscriptions
            WHERE dunning_level < 0
               OR dunning_level > 4
               OR (dunning_level > 0 AND status NOT IN ('overdue', 'cancelled'))
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "dunning_level_bounds".to_string(),
                subscription_ids: vec![row.subscription_id],
                description: format!(
                    "Subscription has dunning level {} while status is '{}'",
                    row.dunning_level, row.status
                ),
                context: serde_json::json!({
                    "status": row.status,
                    "dunning_level": row.dunning_level,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: Cancelled subscriptions have a terminal history entry
    ///
    /// Every cancellation should be visible in the audit log, whether it
    /// came from dunning or a manual action.
    async fn check_cancelled_has_history(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnauditedCancelRow> = sqlx::query_as(
            r#"
            SELECT s.id as subscription_id, s.updated_at
            FROM subscriptions s
            WHERE s.status = 'cancelled'
              AND NOT EXISTS (
                  SELECT 1 FROM subscription_history h
                  WHERE h.subscription_id = s.id
                    AND h.action IN ('cancelled', 'cancelled_by_dunning')
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "cancelled_has_history".to_string(),
                subscription_ids: vec![row.subscription_id],
                description: "Cancelled subscription has no cancellation history entry"
                    .to_string(),
                context: serde_json::json!({
                    "updated_at": row.updated_at,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 6: Overdue subscriptions have an invoice for the due
    /// period
    ///
    /// The dunning scheduler needs that invoice to reference in its
    /// e-mails; its absence means the failure path half-completed.
    async fn check_overdue_has_invoice(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverdueNoInvoiceRow> = sqlx::query_as(
            r#"
            SELECT s.id as subscription_id, s.next_renewal_at
            FROM subscriptions s
            WHERE s.status = 'overdue'
              AND NOT EXISTS (
                  SELECT 1 FROM invoices i
                  WHERE i.subscription_id = s.id
                    AND i.billing_period_start <= s.next_renewal_at
                    AND i.billing_period_end > s.next_renewal_at
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "overdue_has_invoice".to_string(),
                subscription_ids: vec![row.subscription_id],
                description: "Overdue subscription has no invoice covering its due period"
                    .to_string(),
                context: serde_json::json!({
                    "next_renewal_at": row.next_renewal_at,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_live_subscription" => self.check_single_live_subscription().await,
            "one_paid_invoice_per_period" => self.check_one_paid_invoice_per_period().await,
            "paid_invoices_credited" => self.check_paid_invoices_credited().await,
            "dunning_level_bounds" => self.check_dunning_level_bounds().await,
            "cancelled_has_history" => self.check_cancelled_has_history().await,
            "overdue_has_invoice" => self.check_overdue_has_invoice().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_live_subscription",
            "one_paid_invoice_per_period",
            "paid_invoices_credited",
            "dunning_level_bounds",
            "cancelled_has_history",
            "overdue_has_invoice",
        ]
    }
}
