//! Invoice ledger
//!
//! One invoice per subscription billing period. Creation is idempotent per
//! (subscription, period start) - the renewal path and the retry path can
//! both race to create the same period's invoice, and both must land on a
//! single row.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// Invoice status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Failed,
    Void,
    Refunded,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Failed => "failed",
            InvoiceStatus::Void => "void",
            InvoiceStatus::Refunded => "refunded",
        }
    }

    pub fn from_str_or_pending(s: &str) -> Self {
        match s {
            "paid" => InvoiceStatus::Paid,
            "failed" => InvoiceStatus::Failed,
            "void" => InvoiceStatus::Void,
            "refunded" => InvoiceStatus::Refunded,
            _ => InvoiceStatus::Pending,
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Free-form invoice metadata carried from the originating order
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InvoiceMeta {
    /// Reference of the commerce-layer order that produced this invoice
    pub order_ref: Option<String>,
    /// Points credited to the wallet for this invoice
    pub points_granted: Option<i64>,
}

/// An invoice row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    /// Human-readable unique number, e.g. INV-2024-000042
    pub invoice_number: String,
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_method: Option<String>,
    pub gateway_transaction_id: Option<String>,
    /// Set when the invoice is paid but the wallet credit has not landed;
    /// the reconciliation job replays the credit and clears this
    pub credit_pending: bool,
    pub meta: InvoiceMeta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    pub fn is_paid(&self) -> bool {
        self.status == InvoiceStatus::Paid
    }

    /// Whether `ts` falls inside this invoice's billing period
    pub fn covers(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.period_start && ts < self.period_end
    }
}

/// Input for creating an invoice
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub tax_cents: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_method: Option<String>,
    pub gateway_transaction_id: Option<String>,
    pub meta: InvoiceMeta,
}

/// Outcome of a `mark_paid` call
#[derive(Debug, Clone)]
pub enum MarkPaidOutcome {
    /// The invoice transitioned to paid now
    Transitioned(Invoice),
    /// The invoice was already paid; nothing changed
    AlreadyPaid(Invoice),
}

impl MarkPaidOutcome {
    pub fn invoice(&self) -> &Invoice {
        match self {
            MarkPaidOutcome::Transitioned(inv) | MarkPaidOutcome::AlreadyPaid(inv) => inv,
        }
    }

    pub fn transitioned(&self) -> bool {
        matches!(self, MarkPaidOutcome::Transitioned(_))
    }
}

/// Invoice ledger service
pub struct InvoiceLedger {
    store: Arc<dyn BillingStore>,
}

impl InvoiceLedger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Create an invoice for a billing period, or return the one that
    /// already covers that exact period. Overlapping (but not identical)
    /// periods for the same subscription are a `Conflict`.
    ///
    /// Returns the invoice and whether this call created it.
    pub async fn create_invoice(&self, new: NewInvoice) -> BillingResult<(Invoice, bool)> {
        if new.period_end <= new.period_start {
            return Err(BillingError::Conflict(format!(
                "billing period ends ({}) before it starts ({})",
                new.period_end, new.period_start
            )));
        }

        let (invoice, created) = self.store.insert_or_get_invoice(new).await?;

        if created {
            tracing::info!(
                invoice_id = %invoice.id,
                invoice_number = %invoice.invoice_number,
                subscription_id = %invoice.subscription_id,
                period_start = %invoice.period_start,
                status = %invoice.status,
                "Created invoice"
            );
        }

        Ok((invoice, created))
    }

    /// Transition pending/failed -> paid. Calling this on an invoice that
    /// is already paid is a successful no-op, which is what makes replayed
    /// payment events harmless.
    pub async fn mark_paid(
        &self,
        invoice_id: Uuid,
        paid_at: DateTime<Utc>,
        gateway_transaction_id: Option<&str>,
    ) -> BillingResult<MarkPaidOutcome> {
        let outcome = self
            .store
            .mark_invoice_paid(invoice_id, paid_at, gateway_transaction_id)
            .await?;

        if outcome.transitioned() {
            tracing::info!(
                invoice_id = %invoice_id,
                paid_at = %paid_at,
                "Invoice marked paid"
            );
        }

        Ok(outcome)
    }

    /// Transition pending -> failed. A paid invoice is never silently
    /// failed; reversing a paid invoice requires the refund transition.
    pub async fn mark_failed(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        let invoice = self.store.mark_invoice_failed(invoice_id).await?;
        tracing::info!(
            invoice_id = %invoice_id,
            subscription_id = %invoice.subscription_id,
            "Invoice marked failed"
        );
        Ok(invoice)
    }

    /// Transition paid -> refunded. The caller is responsible for revoking
    /// the wallet credit.
    pub async fn mark_refunded(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        let invoice = self.store.mark_invoice_refunded(invoice_id).await?;
        tracing::info!(
            invoice_id = %invoice_id,
            subscription_id = %invoice.subscription_id,
            "Invoice refunded"
        );
        Ok(invoice)
    }

    pub async fn get(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        self.store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", invoice_id)))
    }
}
