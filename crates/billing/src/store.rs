//! Billing storage trait
//!
//! All engine state goes through this seam. The Postgres implementation
//! lives in `pg_store`; the in-memory implementation here backs the test
//! suite. Implementations must make `insert_or_get_invoice`,
//! `escalate_dunning` and `update_subscription` atomic - they are the
//! operations concurrent ticks and payment events race on.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use uuid::Uuid;

use crate::dunning::DunningEmail;
use crate::error::{BillingError, BillingResult};
use crate::history::HistoryEntry;
use crate::invoices::{Invoice, InvoiceStatus, MarkPaidOutcome, NewInvoice};
use crate::retries::{PaymentRetry, RetryStatus};
use crate::subscriptions::{Subscription, SubscriptionStatus};

/// Persistence operations for the billing engine
#[async_trait]
pub trait BillingStore: Send + Sync {
    // Subscriptions

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    /// The one live (active/paused/overdue) subscription for (user, plan)
    async fn find_live_subscription(
        &self,
        user_id: Uuid,
        plan_key: &str,
    ) -> BillingResult<Option<Subscription>>;

    /// Insert a new subscription; `Conflict` if a live one exists for the
    /// same (user, plan)
    async fn insert_subscription(&self, sub: Subscription) -> BillingResult<Subscription>;

    /// Persist subscription fields. Optimistically locked on `version`:
    /// a stale write is `ConcurrentModification`.
    async fn update_subscription(&self, sub: Subscription) -> BillingResult<Subscription>;

    /// Conditionally advance the dunning level (and optionally cancel).
    /// Succeeds only if the row is still overdue in the same episode at
    /// the expected level; returns false when a concurrent transition
    /// (e.g. the customer paid mid-tick) got there first.
    async fn escalate_dunning(
        &self,
        id: Uuid,
        episode: i32,
        expected_level: i16,
        new_level: i16,
        cancel: bool,
        now: DateTime<Utc>,
    ) -> BillingResult<bool>;

    async fn list_overdue_subscriptions(&self) -> BillingResult<Vec<Subscription>>;

    /// Active subscriptions whose renewal is due before `cutoff`
    async fn list_active_renewing_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> BillingResult<Vec<Subscription>>;

    // Invoices

    /// Atomically create an invoice, or fetch the one that already covers
    /// the identical period. Overlap with a different period of the same
    /// subscription is `Conflict`. Returns (invoice, created-by-this-call).
    async fn insert_or_get_invoice(&self, new: NewInvoice) -> BillingResult<(Invoice, bool)>;

    async fn get_invoice(&self, id: Uuid) -> BillingResult<Option<Invoice>>;

    /// The invoice whose billing period contains `ts`, if any
    async fn find_invoice_covering(
        &self,
        subscription_id: Uuid,
        ts: DateTime<Utc>,
    ) -> BillingResult<Option<Invoice>>;

    async fn mark_invoice_paid(
        &self,
        id: Uuid,
        paid_at: DateTime<Utc>,
        gateway_transaction_id: Option<&str>,
    ) -> BillingResult<MarkPaidOutcome>;

    async fn mark_invoice_failed(&self, id: Uuid) -> BillingResult<Invoice>;

    async fn mark_invoice_refunded(&self, id: Uuid) -> BillingResult<Invoice>;

    async fn set_credit_pending(&self, id: Uuid, pending: bool) -> BillingResult<()>;

    /// Paid invoices still waiting for their wallet credit
    async fn list_credit_pending(&self) -> BillingResult<Vec<Invoice>>;

    // Payment attempts

    /// Append an attempt with the next attempt number for the invoice.
    /// Any prior attempt still scheduled/in-progress is abandoned first.
    async fn log_payment_attempt(
        &self,
        subscription_id: Uuid,
        invoice_id: Uuid,
        status: RetryStatus,
        at: DateTime<Utc>,
    ) -> BillingResult<PaymentRetry>;

    async fn list_payment_attempts(&self, invoice_id: Uuid) -> BillingResult<Vec<PaymentRetry>>;

    // Dunning e-mails

    /// Record a dunning e-mail; returns false (and stores nothing) when
    /// one already exists for (subscription, episode, level)
    async fn record_dunning_email(&self, email: DunningEmail) -> BillingResult<bool>;

    /// Remove a record whose send ultimately failed so the level is
    /// retried next tick
    async fn delete_dunning_email(&self, id: Uuid) -> BillingResult<()>;

    async fn count_dunning_emails_since(&self, since: DateTime<Utc>) -> BillingResult<u64>;

    async fn list_dunning_emails(&self, subscription_id: Uuid)
        -> BillingResult<Vec<DunningEmail>>;

    // History

    async fn append_history(&self, entry: HistoryEntry) -> BillingResult<()>;

    async fn list_history(&self, subscription_id: Uuid) -> BillingResult<Vec<HistoryEntry>>;

    // Users

    /// Platform role of a user, for the dunning exclusion guardrail
    async fn user_role(&self, user_id: Uuid) -> BillingResult<Option<String>>;
}

#[derive(Default)]
struct InMemoryState {
    subscriptions: HashMap<Uuid, Subscription>,
    invoices: HashMap<Uuid, Invoice>,
    attempts: Vec<PaymentRetry>,
    emails: Vec<DunningEmail>,
    history: Vec<HistoryEntry>,
    roles: HashMap<Uuid, String>,
    invoice_seq: u64,
}

/// In-memory store for tests and local development
#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryState> {
        // A poisoned lock only means a panicking test; take the data as-is
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Test helper: register a user role for the exclusion guardrail
    pub fn set_user_role(&self, user_id: Uuid, role: &str) {
        self.lock().roles.insert(user_id, role.to_string());
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.lock().subscriptions.get(&id).cloned())
    }

    async fn find_live_subscription(
        &self,
        user_id: Uuid,
        plan_key: &str,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .find(|s| s.user_id == user_id && s.plan_key == plan_key && s.is_live())
            .cloned())
    }

    async fn insert_subscription(&self, sub: Subscription) -> BillingResult<Subscription> {
        let mut state = self.lock();
        let duplicate = state
            .subscriptions
            .values()
            .any(|s| s.user_id == sub.user_id && s.plan_key == sub.plan_key && s.is_live());
        if duplicate {
            return Err(BillingError::Conflict(format!(
                "user {} already has a live '{}' subscription",
                sub.user_id, sub.plan_key
            )));
        }
        state.subscriptions.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn update_subscription(&self, mut sub: Subscription) -> BillingResult<Subscription> {
        let mut state = self.lock();
        let current = state
            .subscriptions
            .get(&sub.id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", sub.id)))?;
        if current.version != sub.version {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription {} was modified by another process",
                sub.id
            )));
        }
        sub.version += 1;
        sub.updated_at = Utc::now();
        state.subscriptions.insert(sub.id, sub.clone());
        Ok(sub)
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
        let mut state = self.lock();
        let Some(sub) = state.subscriptions.get_mut(&id) else {
            return Ok(false);
        };
        if sub.status != SubscriptionStatus::Overdue
            || sub.dunning_episode != episode
            || sub.dunning_level != expected_level
        {
            return Ok(false);
        }
        sub.dunning_level = new_level;
        if cancel {
            sub.status = SubscriptionStatus::Cancelled;
        }
        sub.version += 1;
        sub.updated_at = now;
        Ok(true)
    }

    async fn list_overdue_subscriptions(&self) -> BillingResult<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = self
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Overdue)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.created_at);
        Ok(subs)
    }

    async fn list_active_renewing_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> BillingResult<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = self
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active && s.next_renewal_at <= cutoff)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.next_renewal_at);
        Ok(subs)
    }

    async fn insert_or_get_invoice(&self, new: NewInvoice) -> BillingResult<(Invoice, bool)> {
        let mut state = self.lock();

        if let Some(existing) = state
            .invoices
            .values()
            .find(|i| i.subscription_id == new.subscription_id && i.period_start == new.period_start)
        {
            return Ok((existing.clone(), false));
        }

        let overlap = state.invoices.values().any(|i| {
            i.subscription_id == new.subscription_id
                && new.period_start < i.period_end
                && i.period_start < new.period_end
        });
        if overlap {
            return Err(BillingError::Conflict(format!(
                "billing period starting {} overlaps an existing invoice",
                new.period_start
            )));
        }

        state.invoice_seq += 1;
        let now = Utc::now();
        let invoice = Invoice {
            id: Uuid::new_v4(),
            invoice_number: format!("INV-{}-{:06}", now.year(), state.invoice_seq),
            subscription_id: new.subscription_id,
            user_id: new.user_id,
            amount_cents: new.amount_cents,
            tax_cents: new.tax_cents,
            total_cents: new.amount_cents + new.tax_cents,
            currency: new.currency,
            status: new.status,
            period_start: new.period_start,
            period_end: new.period_end,
            due_date: new.due_date,
            paid_at: new.paid_at,
            payment_method: new.payment_method,
            gateway_transaction_id: new.gateway_transaction_id,
            credit_pending: false,
            meta: new.meta,
            created_at: now,
            updated_at: now,
        };
        state.invoices.insert(invoice.id, invoice.clone());
        Ok((invoice, true))
    }

    async fn get_invoice(&self, id: Uuid) -> BillingResult<Option<Invoice>> {
        Ok(self.lock().invoices.get(&id).cloned())
    }

    async fn find_invoice_covering(
        &self,
        subscription_id: Uuid,
        ts: DateTime<Utc>,
    ) -> BillingResult<Option<Invoice>> {
        Ok(self
            .lock()
            .invoices
            .values()
            .find(|i| i.subscription_id == subscription_id && i.covers(ts))
            .cloned())
    }

    async fn mark_invoice_paid(
        &self,
        id: Uuid,
        paid_at: DateTime<Utc>,
        gateway_transaction_id: Option<&str>,
    ) -> BillingResult<MarkPaidOutcome> {
        let mut state = self.lock();
        let invoice = state
            .invoices
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", id)))?;

        match invoice.status {
            InvoiceStatus::Paid => Ok(MarkPaidOutcome::AlreadyPaid(invoice.clone())),
            InvoiceStatus::Pending | InvoiceStatus::Failed => {
                invoice.status = InvoiceStatus::Paid;
                invoice.paid_at = Some(paid_at);
                if let Some(txn) = gateway_transaction_id {
                    invoice.gateway_transaction_id = Some(txn.to_string());
                }
                invoice.updated_at = Utc::now();
                Ok(MarkPaidOutcome::Transitioned(invoice.clone()))
            }
            status => Err(BillingError::InvalidTransition(format!(
                "cannot pay a {} invoice",
                status
            ))),
        }
    }

    async fn mark_invoice_failed(&self, id: Uuid) -> BillingResult<Invoice> {
        let mut state = self.lock();
        let invoice = state
            .invoices
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", id)))?;

        match invoice.status {
            InvoiceStatus::Pending => {
                invoice.status = InvoiceStatus::Failed;
                invoice.updated_at = Utc::now();
                Ok(invoice.clone())
            }
            // Repeated failure reports are expected during retries
            InvoiceStatus::Failed => Ok(invoice.clone()),
            status => Err(BillingError::InvalidTransition(format!(
                "cannot fail a {} invoice",
                status
            ))),
        }
    }

    async fn mark_invoice_refunded(&self, id: Uuid) -> BillingResult<Invoice> {
        let mut state = self.lock();
        let invoice = state
            .invoices
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", id)))?;

        match invoice.status {
            InvoiceStatus::Paid => {
                invoice.status = InvoiceStatus::Refunded;
                invoice.updated_at = Utc::now();
                Ok(invoice.clone())
            }
            status => Err(BillingError::InvalidTransition(format!(
                "cannot refund a {} invoice",
                status
            ))),
        }
    }

    async fn set_credit_pending(&self, id: Uuid, pending: bool) -> BillingResult<()> {
        let mut state = self.lock();
        let invoice = state
            .invoices
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", id)))?;
        invoice.credit_pending = pending;
        invoice.updated_at = Utc::now();
        Ok(())
    }

    async fn list_credit_pending(&self) -> BillingResult<Vec<Invoice>> {
        Ok(self
            .lock()
            .invoices
            .values()
            .filter(|i| i.credit_pending && i.status == InvoiceStatus::Paid)
            .cloned()
            .collect())
    }

    async fn log_payment_attempt(
        &self,
        subscription_id: Uuid,
        invoice_id: Uuid,
        status: RetryStatus,
        at: DateTime<Utc>,
    ) -> BillingResult<PaymentRetry> {
        let mut state = self.lock();

        let next_number = state
            .attempts
            .iter()
            .filter(|a| a.invoice_id == invoice_id)
            .map(|a| a.attempt_number)
            .max()
            .unwrap_or(0)
            + 1;

        for attempt in state
            .attempts
            .iter_mut()
            .filter(|a| a.invoice_id == invoice_id && a.status.is_open())
        {
            attempt.status = RetryStatus::Abandoned;
        }

        let retry = PaymentRetry {
            id: Uuid::new_v4(),
            subscription_id,
            invoice_id,
            attempt_number: next_number,
            status,
            scheduled_at: at,
        };
        state.attempts.push(retry.clone());
        Ok(retry)
    }

    async fn list_payment_attempts(&self, invoice_id: Uuid) -> BillingResult<Vec<PaymentRetry>> {
        let mut attempts: Vec<PaymentRetry> = self
            .lock()
            .attempts
            .iter()
            .filter(|a| a.invoice_id == invoice_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    async fn record_dunning_email(&self, email: DunningEmail) -> BillingResult<bool> {
        let mut state = self.lock();
        let exists = state.emails.iter().any(|e| {
            e.subscription_id == email.subscription_id
                && e.episode == email.episode
                && e.level == email.level
        });
        if exists {
            return Ok(false);
        }
        state.emails.push(email);
        Ok(true)
    }

    async fn delete_dunning_email(&self, id: Uuid) -> BillingResult<()> {
        self.lock().emails.retain(|e| e.id != id);
        Ok(())
    }

    async fn count_dunning_emails_since(&self, since: DateTime<Utc>) -> BillingResult<u64> {
        Ok(self
            .lock()
            .emails
            .iter()
            .filter(|e| e.sent_at >= since)
            .count() as u64)
    }

    async fn list_dunning_emails(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<DunningEmail>> {
        let mut emails: Vec<DunningEmail> = self
            .lock()
            .emails
            .iter()
            .filter(|e| e.subscription_id == subscription_id)
            .cloned()
            .collect();
        emails.sort_by_key(|e| (e.episode, e.level));
        Ok(emails)
    }

    async fn append_history(&self, entry: HistoryEntry) -> BillingResult<()> {
        self.lock().history.push(entry);
        Ok(())
    }

    async fn list_history(&self, subscription_id: Uuid) -> BillingResult<Vec<HistoryEntry>> {
        Ok(self
            .lock()
            .history
            .iter()
            .filter(|h| h.subscription_id == subscription_id)
            .cloned()
            .collect())
    }

    async fn user_role(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        Ok(self.lock().roles.get(&user_id).cloned())
    }
}
