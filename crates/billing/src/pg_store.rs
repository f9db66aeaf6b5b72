//! Postgres-backed billing store
//!
//! Raw SQL over a `PgPool`. The correctness-critical operations map to
//! atomic statements: invoice creation is `INSERT ... ON CONFLICT DO
//! NOTHING` against the (subscription, period start) unique index,
//! dunning escalation is a conditional `UPDATE ... WHERE` on (status,
//! episode, level), and subscription writes are version-checked.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::dunning::DunningEmail;
use crate::error::{BillingError, BillingResult};
use crate::history::{Actor, HistoryAction, HistoryEntry};
use crate::invoices::{Invoice, InvoiceMeta, InvoiceStatus, MarkPaidOutcome, NewInvoice};
use crate::renewal::BillingInterval;
use crate::retries::{PaymentRetry, RetryStatus};
use crate::store::BillingStore;
use crate::subscriptions::{Subscription, SubscriptionMeta, SubscriptionStatus};

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_key, points_per_interval, interval_unit, \
     interval_count, amount_cents, currency, status, next_renewal_at, last_payment_attempt, \
     failed_payment_count, dunning_level, dunning_episode, payment_method, meta, version, \
     created_at, updated_at";

const INVOICE_COLUMNS: &str = "id, invoice_number, subscription_id, user_id, amount_cents, \
     tax_cents, total_cents, currency, status, billing_period_start, billing_period_end, \
     due_date, paid_at, payment_method, gateway_transaction_id, credit_pending, meta, \
     created_at, updated_at";

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    plan_key: String,
    points_per_interval: i64,
    interval_unit: String,
    interval_count: i32,
    amount_cents: i64,
    currency: String,
    status: String,
    next_renewal_at: DateTime<Utc>,
    last_payment_attempt: Option<DateTime<Utc>>,
    failed_payment_count: i32,
    dunning_level: i16,
    dunning_episode: i32,
    payment_method: Option<String>,
    meta: serde_json::Value,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        let meta: SubscriptionMeta = serde_json::from_value(row.meta)
            .map_err(|e| BillingError::Database(format!("bad subscription meta: {}", e)))?;
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            plan_key: row.plan_key,
            points_per_interval: row.points_per_interval,
            interval: BillingInterval::parse(&row.interval_unit)?,
            interval_count: row.interval_count.max(1) as u32,
            amount_cents: row.amount_cents,
            currency: row.currency,
            status: SubscriptionStatus::from_str_or_cancelled(&row.status),
            next_renewal_at: row.next_renewal_at,
            last_payment_attempt: row.last_payment_attempt,
            failed_payment_count: row.failed_payment_count,
            dunning_level: row.dunning_level,
            dunning_episode: row.dunning_episode,
            payment_method: row.payment_method,
            meta,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InvoiceRow {
    id: Uuid,
    invoice_number: String,
    subscription_id: Uuid,
    user_id: Uuid,
    amount_cents: i64,
    tax_cents: i64,
    total_cents: i64,
    currency: String,
    status: String,
    billing_period_start: DateTime<Utc>,
    billing_period_end: DateTime<Utc>,
    due_date: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
    payment_method: Option<String>,
    gateway_transaction_id: Option<String>,
    credit_pending: bool,
    meta: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = BillingError;

    fn try_from(row: InvoiceRow) -> BillingResult<Self> {
        let meta: InvoiceMeta = serde_json::from_value(row.meta)
            .map_err(|e| BillingError::Database(format!("bad invoice meta: {}", e)))?;
        Ok(Invoice {
            id: row.id,
            invoice_number: row.invoice_number,
            subscription_id: row.subscription_id,
            user_id: row.user_id,
            amount_cents: row.amount_cents,
            tax_cents: row.tax_cents,
            total_cents: row.total_cents,
            currency: row.currency,
            status: InvoiceStatus::from_str_or_pending(&row.status),
            period_start: row.billing_period_start,
            period_end: row.billing_period_end,
            due_date: row.due_date,
            paid_at: row.paid_at,
            payment_method: row.payment_method,
            gateway_transaction_id: row.gateway_transaction_id,
            credit_pending: row.credit_pending,
            meta,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RetryRow {
    id: Uuid,
    subscription_id: Uuid,
    invoice_id: Uuid,
    attempt_number: i32,
    status: String,
    scheduled_at: DateTime<Utc>,
}

impl From<RetryRow> for PaymentRetry {
    fn from(row: RetryRow) -> Self {
        PaymentRetry {
            id: row.id,
            subscription_id: row.subscription_id,
            invoice_id: row.invoice_id,
            attempt_number: row.attempt_number,
            status: RetryStatus::from_str_or_abandoned(&row.status),
            scheduled_at: row.scheduled_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DunningEmailRow {
    id: Uuid,
    subscription_id: Uuid,
    invoice_id: Uuid,
    user_id: Uuid,
    episode: i32,
    level: i16,
    email_type: String,
    sent_at: DateTime<Utc>,
    opened_at: Option<DateTime<Utc>>,
    clicked_at: Option<DateTime<Utc>>,
    converted_at: Option<DateTime<Utc>>,
}

impl From<DunningEmailRow> for DunningEmail {
    fn from(row: DunningEmailRow) -> Self {
        DunningEmail {
            id: row.id,
            subscription_id: row.subscription_id,
            invoice_id: row.invoice_id,
            user_id: row.user_id,
            episode: row.episode,
            level: row.level,
            email_type: row.email_type,
            sent_at: row.sent_at,
            opened_at: row.opened_at,
            clicked_at: row.clicked_at,
            converted_at: row.converted_at,
        }
    }
}

/// Production billing store
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn subscription_params(
        sub: &Subscription,
    ) -> BillingResult<(String, String, serde_json::Value)> {
        let meta = serde_json::to_value(&sub.meta)
            .map_err(|e| BillingError::Internal(format!("serialize subscription meta: {}", e)))?;
        Ok((
            sub.interval.as_str().to_string(),
            sub.status.as_str().to_string(),
            meta,
        ))
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn find_live_subscription(
        &self,
        user_id: Uuid,
        plan_key: &str,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE user_id = $1 AND plan_key = $2
              AND status IN ('active', 'paused', 'overdue')
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .bind(plan_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn insert_subscription(&self, sub: Subscription) -> BillingResult<Subscription> {
        let (interval, status, meta) = Self::subscription_params(&sub)?;

        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions
                (id, user_id, plan_key, points_per_interval, interval_unit, interval_count,
                 amount_cents, currency, status, next_renewal_at, last_payment_attempt,
                 failed_payment_count, dunning_level, dunning_episode, payment_method, meta,
                 version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19)
            "#,
        )
        .bind(sub.id)
        .bind(sub.user_id)
        .bind(&sub.plan_key)
        .bind(sub.points_per_interval)
        .bind(&interval)
        .bind(sub.interval_count as i32)
        .bind(sub.amount_cents)
        .bind(&sub.currency)
        .bind(&status)
        .bind(sub.next_renewal_at)
        .bind(sub.last_payment_attempt)
        .bind(sub.failed_payment_count)
        .bind(sub.dunning_level)
        .bind(sub.dunning_episode)
        .bind(&sub.payment_method)
        .bind(&meta)
        .bind(sub.version)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(sub),
            // The partial unique index on live (user_id, plan_key) enforces
            // the single-live-subscription rule at the database level
            Err(e) if e.as_database_error().is_some_and(|d| d.is_unique_violation()) => {
                Err(BillingError::Conflict(format!(
                    "user {} already has a live '{}' subscription",
                    sub.user_id, sub.plan_key
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_subscription(&self, sub: Subscription) -> BillingResult<Subscription> {
        let (interval, status, meta) = Self::subscription_params(&sub)?;

        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                points_per_interval = $2,
                interval_unit = $3,
                interval_count = $4,
                amount_cents = $5,
                currency = $6,
                status = $7,
                next_renewal_at = $8,
                last_payment_attempt = $9,
                failed_payment_count = $10,
                dunning_level = $11,
                dunning_episode = $12,
                payment_method = $13,
                meta = $14,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $15
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(sub.id)
        .bind(sub.points_per_interval)
        .bind(&interval)
        .bind(sub.interval_count as i32)
        .bind(sub.amount_cents)
        .bind(&sub.currency)
        .bind(&status)
        .bind(sub.next_renewal_at)
        .bind(sub.last_payment_attempt)
        .bind(sub.failed_payment_count)
        .bind(sub.dunning_level)
        .bind(sub.dunning_episode)
        .bind(&sub.payment_method)
        .bind(&meta)
        .bind(sub.version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(BillingError::ConcurrentModification(format!(
                "subscription {} was modified by another process",
                sub.id
            ))),
        }
    }

    async fn escalate_dunning(
        &self,
        id: Uuid,
        episode: i32,
        expected_level: i16,
        new_level: i16,
        cancel: bool,
        now: DateTime<Utc>,
    ) -> BillingResult<bool> {
        let updated: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions SET
                dunning_level = $4,
                status = CASE WHEN $5 THEN 'cancelled' ELSE status END,
                version = version + 1,
                updated_at = $6
            WHERE id = $1
              AND status = 'overdue'
              AND dunning_episode = $2
              AND dunning_level = $3
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(episode)
        .bind(expected_level)
        .bind(new_level)
        .bind(cancel)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(updated.is_some())
    }

    async fn list_overdue_subscriptions(&self) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE status = 'overdue' ORDER BY created_at",
            SUBSCRIPTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn list_active_renewing_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE status = 'active' AND next_renewal_at <= $1
            ORDER BY next_renewal_at
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn insert_or_get_invoice(&self, new: NewInvoice) -> BillingResult<(Invoice, bool)> {
        // Reject overlap with a *different* period up front; the unique
        // index below handles the identical-period race
        let overlap: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM invoices
            WHERE subscription_id = $1
              AND billing_period_start <> $2
              AND billing_period_start < $3
              AND billing_period_end > $2
            LIMIT 1
            "#,
        )
        .bind(new.subscription_id)
        .bind(new.period_start)
        .bind(new.period_end)
        .fetch_optional(&self.pool)
        .await?;

        if overlap.is_some() {
            return Err(BillingError::Conflict(format!(
                "billing period starting {} overlaps an existing invoice",
                new.period_start
            )));
        }

        let meta = serde_json::to_value(&new.meta)
            .map_err(|e| BillingError::Internal(format!("serialize invoice meta: {}", e)))?;

        let (seq,): (i64,) = sqlx::query_as("SELECT nextval('invoice_number_seq')")
            .fetch_one(&self.pool)
            .await?;
        let invoice_number = format!("INV-{}-{:06}", Utc::now().year(), seq);

        let inserted: Option<InvoiceRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO invoices
                (id, invoice_number, subscription_id, user_id, amount_cents, tax_cents,
                 total_cents, currency, status, billing_period_start, billing_period_end,
                 due_date, paid_at, payment_method, gateway_transaction_id, credit_pending,
                 meta, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, false,
                    $16, NOW(), NOW())
            ON CONFLICT (subscription_id, billing_period_start) DO NOTHING
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&invoice_number)
        .bind(new.subscription_id)
        .bind(new.user_id)
        .bind(new.amount_cents)
        .bind(new.tax_cents)
        .bind(new.amount_cents + new.tax_cents)
        .bind(&new.currency)
        .bind(new.status.as_str())
        .bind(new.period_start)
        .bind(new.period_end)
        .bind(new.due_date)
        .bind(new.paid_at)
        .bind(&new.payment_method)
        .bind(&new.gateway_transaction_id)
        .bind(&meta)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((row.try_into()?, true));
        }

        // Lost the insert race (or the invoice predates this call): hand
        // back the row that owns the period
        let row: InvoiceRow = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM invoices
            WHERE subscription_id = $1 AND billing_period_start = $2
            "#,
            INVOICE_COLUMNS
        ))
        .bind(new.subscription_id)
        .bind(new.period_start)
        .fetch_one(&self.pool)
        .await?;

        Ok((row.try_into()?, false))
    }

    async fn get_invoice(&self, id: Uuid) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM invoices WHERE id = $1",
            INVOICE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Invoice::try_from).transpose()
    }

    async fn find_invoice_covering(
        &self,
        subscription_id: Uuid,
        ts: DateTime<Utc>,
    ) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM invoices
            WHERE subscription_id = $1
              AND billing_period_start <= $2
              AND billing_period_end > $2
            "#,
            INVOICE_COLUMNS
        ))
        .bind(subscription_id)
        .bind(ts)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Invoice::try_from).transpose()
    }

    async fn mark_invoice_paid(
        &self,
        id: Uuid,
        paid_at: DateTime<Utc>,
        gateway_transaction_id: Option<&str>,
    ) -> BillingResult<MarkPaidOutcome> {
        let updated: Option<InvoiceRow> = sqlx::query_as(&format!(
            r#"
            UPDATE invoices SET
                status = 'paid',
                paid_at = $2,
                gateway_transaction_id = COALESCE($3, gateway_transaction_id),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'failed')
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(id)
        .bind(paid_at)
        .bind(gateway_transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return Ok(MarkPaidOutcome::Transitioned(row.try_into()?));
        }

        let existing = self
            .get_invoice(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", id)))?;

        match existing.status {
            InvoiceStatus::Paid => Ok(MarkPaidOutcome::AlreadyPaid(existing)),
            status => Err(BillingError::InvalidTransition(format!(
                "cannot pay a {} invoice",
                status
            ))),
        }
    }

    async fn mark_invoice_failed(&self, id: Uuid) -> BillingResult<Invoice> {
        let updated: Option<InvoiceRow> = sqlx::query_as(&format!(
            r#"
            UPDATE invoices SET status = 'failed', updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return row.try_into();
        }

        let existing = self
            .get_invoice(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", id)))?;

        match existing.status {
            // Repeated failure reports are expected during retries
            InvoiceStatus::Failed => Ok(existing),
            status => Err(BillingError::InvalidTransition(format!(
                "cannot fail a {} invoice",
                status
            ))),
        }
    }

    async fn mark_invoice_refunded(&self, id: Uuid) -> BillingResult<Invoice> {
        let updated: Option<InvoiceRow> = sqlx::query_as(&format!(
            r#"
            UPDATE invoices SET status = 'refunded', updated_at = NOW()
            WHERE id = $1 AND status = 'paid'
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return row.try_into();
        }

        let existing = self
            .get_invoice(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", id)))?;

        Err(BillingError::InvalidTransition(format!(
            "cannot refund a {} invoice",
            existing.status
        )))
    }

    async fn set_credit_pending(&self, id: Uuid, pending: bool) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE invoices SET credit_pending = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(pending)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("invoice {}", id)));
        }
        Ok(())
    }

    async fn list_credit_pending(&self) -> BillingResult<Vec<Invoice>> {
        let rows: Vec<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM invoices WHERE credit_pending = true AND status = 'paid'",
            INVOICE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Invoice::try_from).collect()
    }

    async fn log_payment_attempt(
        &self,
        subscription_id: Uuid,
        invoice_id: Uuid,
        status: RetryStatus,
        at: DateTime<Utc>,
    ) -> BillingResult<PaymentRetry> {
        // Close out any attempt still open before opening the next
        sqlx::query(
            r#"
            UPDATE payment_retries SET status = 'abandoned'
            WHERE invoice_id = $1 AND status IN ('scheduled', 'in_progress')
            "#,
        )
        .bind(invoice_id)
        .execute(&self.pool)
        .await?;

        let row: RetryRow = sqlx::query_as(
            r#"
            INSERT INTO payment_retries
                (id, subscription_id, invoice_id, attempt_number, status, scheduled_at)
            VALUES (
                $1, $2, $3,
                (SELECT COALESCE(MAX(attempt_number), 0) + 1
                   FROM payment_retries WHERE invoice_id = $3),
                $4, $5
            )
            RETURNING id, subscription_id, invoice_id, attempt_number, status, scheduled_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subscription_id)
        .bind(invoice_id)
        .bind(status.as_str())
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn list_payment_attempts(&self, invoice_id: Uuid) -> BillingResult<Vec<PaymentRetry>> {
        let rows: Vec<RetryRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, invoice_id, attempt_number, status, scheduled_at
            FROM payment_retries
            WHERE invoice_id = $1
            ORDER BY attempt_number
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PaymentRetry::from).collect())
    }

    async fn record_dunning_email(&self, email: DunningEmail) -> BillingResult<bool> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO dunning_emails
                (id, subscription_id, invoice_id, user_id, episode, level, email_type, sent_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (subscription_id, episode, level) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(email.id)
        .bind(email.subscription_id)
        .bind(email.invoice_id)
        .bind(email.user_id)
        .bind(email.episode)
        .bind(email.level)
        .bind(&email.email_type)
        .bind(email.sent_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(inserted.is_some())
    }

    async fn delete_dunning_email(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query("DELETE FROM dunning_emails WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_dunning_emails_since(&self, since: DateTime<Utc>) -> BillingResult<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dunning_emails WHERE sent_at >= $1")
                .bind(since)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn list_dunning_emails(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<DunningEmail>> {
        let rows: Vec<DunningEmailRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, invoice_id, user_id, episode, level, email_type,
                   sent_at, opened_at, clicked_at, converted_at
            FROM dunning_emails
            WHERE subscription_id = $1
            ORDER BY episode, level
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(DunningEmail::from).collect())
    }

    async fn append_history(&self, entry: HistoryEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_history
                (id, subscription_id, action, note, actor_type, actor_id, context, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.subscription_id)
        .bind(entry.action.as_str())
        .bind(&entry.note)
        .bind(entry.actor.kind())
        .bind(entry.actor.id())
        .bind(&entry.context)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_history(&self, subscription_id: Uuid) -> BillingResult<Vec<HistoryEntry>> {
        #[derive(sqlx::FromRow)]
        struct HistoryRow {
            id: Uuid,
            subscription_id: Uuid,
            action: String,
            note: String,
            actor_type: String,
            actor_id: Option<Uuid>,
            context: serde_json::Value,
            created_at: DateTime<Utc>,
        }

        let rows: Vec<HistoryRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, action, note, actor_type, actor_id, context, created_at
            FROM subscription_history
            WHERE subscription_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let actor = match (row.actor_type.as_str(), row.actor_id) {
                    ("user", Some(id)) => Actor::User(id),
                    ("admin", Some(id)) => Actor::Admin(id),
                    _ => Actor::System,
                };
                HistoryEntry {
                    id: row.id,
                    subscription_id: row.subscription_id,
                    action: history_action_from_str(&row.action),
                    note: row.note,
                    actor,
                    context: row.context,
                    created_at: row.created_at,
                }
            })
            .collect())
    }

    async fn user_role(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        let role: Option<(String,)> = sqlx::query_as("SELECT role FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(role.map(|(r,)| r))
    }
}

fn history_action_from_str(s: &str) -> HistoryAction {
    match s {
        "created" => HistoryAction::Created,
        "renewed" => HistoryAction::Renewed,
        "payment_failed" => HistoryAction::PaymentFailed,
        "dunning_level_advanced" => HistoryAction::DunningLevelAdvanced,
        "cancelled_by_dunning" => HistoryAction::CancelledByDunning,
        "paused" => HistoryAction::Paused,
        "resumed" => HistoryAction::Resumed,
        "credit_pending" => HistoryAction::CreditPending,
        "credit_reconciled" => HistoryAction::CreditReconciled,
        "refunded" => HistoryAction::Refunded,
        _ => HistoryAction::Cancelled,
    }
}
