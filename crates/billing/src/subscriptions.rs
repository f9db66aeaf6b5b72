//! Subscription lifecycle state machine
//!
//! Consumes order events from the commerce layer, keeps invoices and the
//! wallet ledger consistent, and owns every subscription status
//! transition except dunning escalation (which belongs to the scheduler).
//!
//! The duplicate-delivery story: invoice creation is idempotent per
//! billing period, `mark_paid` is a no-op on a paid invoice, and wallet
//! credits are keyed by (subscription, invoice). Replaying any event is
//! therefore harmless by construction.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{ManualAction, ManualActionKind, OrderFailed, OrderPaid, SubscriptionRef};
use crate::history::{Actor, HistoryAction, HistoryEntry};
use crate::invoices::{Invoice, InvoiceLedger, InvoiceMeta, InvoiceStatus, NewInvoice};
use crate::notify::Notifier;
use crate::renewal::{next_billing_timestamp, BillingInterval};
use crate::retries::RetryStatus;
use crate::store::BillingStore;
use crate::wallet::{CreditKey, WalletGateway};

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Overdue,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Overdue => "overdue",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str_or_cancelled(s: &str) -> Self {
        match s {
            "active" => SubscriptionStatus::Active,
            "paused" => SubscriptionStatus::Paused,
            "overdue" => SubscriptionStatus::Overdue,
            _ => SubscriptionStatus::Cancelled,
        }
    }

    /// Live = counts against the one-subscription-per-(user, plan) rule
    pub fn is_live(&self) -> bool {
        !matches!(self, SubscriptionStatus::Cancelled)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which renewal reminders went out for the current cycle.
/// Cleared on every successful renewal.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReminderFlags {
    pub three_day: bool,
    pub one_day: bool,
}

impl ReminderFlags {
    pub fn sent(&self, days_before: u32) -> bool {
        match days_before {
            1 => self.one_day,
            3 => self.three_day,
            _ => false,
        }
    }

    pub fn mark_sent(&mut self, days_before: u32) {
        match days_before {
            1 => self.one_day = true,
            3 => self.three_day = true,
            _ => {}
        }
    }
}

/// Typed subscription metadata (replaces the legacy serialized option bag)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionMeta {
    pub plan_name: Option<String>,
    /// Timestamp of the last successful renewal payment
    pub last_renewal_at: Option<DateTime<Utc>>,
    /// Interval count at signup, kept for audit even if the plan changes
    pub interval_count: Option<u32>,
    pub reminders_sent: ReminderFlags,
}

/// A recurring points subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_key: String,
    /// Points credited to the wallet each billing cycle
    pub points_per_interval: i64,
    pub interval: BillingInterval,
    pub interval_count: u32,
    /// Recurring charge, snapshot from the signup order
    pub amount_cents: i64,
    pub currency: String,
    pub status: SubscriptionStatus,
    pub next_renewal_at: DateTime<Utc>,
    pub last_payment_attempt: Option<DateTime<Utc>>,
    pub failed_payment_count: i32,
    /// 0 unless overdue; monotonically non-decreasing within an episode
    pub dunning_level: i16,
    /// Increments each time the subscription enters overdue, so dunning
    /// e-mail uniqueness survives recover-then-fail-again cycles
    pub dunning_episode: i32,
    pub payment_method: Option<String>,
    pub meta: SubscriptionMeta,
    /// Optimistic-lock version, bumped on every write
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}

/// A purchasable recurring plan
#[derive(Debug, Clone)]
pub struct Plan {
    pub key: String,
    pub name: String,
    pub points_per_interval: i64,
    pub interval: BillingInterval,
    pub interval_count: u32,
}

/// Catalog of plans the commerce layer can sell
#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    plans: HashMap<String, Plan>,
}

impl PlanCatalog {
    pub fn new(plans: Vec<Plan>) -> Self {
        Self {
            plans: plans.into_iter().map(|p| (p.key.clone(), p)).collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Plan> {
        self.plans.get(key)
    }
}

/// Summary of a credit reconciliation sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
    pub scanned: usize,
    pub reconciled: usize,
    pub still_pending: usize,
}

/// The subscription state machine service
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    ledger: InvoiceLedger,
    wallet: Arc<dyn WalletGateway>,
    notifier: Arc<dyn Notifier>,
    plans: PlanCatalog,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        wallet: Arc<dyn WalletGateway>,
        notifier: Arc<dyn Notifier>,
        plans: PlanCatalog,
    ) -> Self {
        let ledger = InvoiceLedger::new(store.clone());
        Self {
            store,
            ledger,
            wallet,
            notifier,
            plans,
        }
    }

    /// Apply a successful recurring payment.
    ///
    /// First payment for a plan creates the subscription; later payments
    /// renew it. Replays of an already-applied payment re-run the
    /// idempotent invoice/credit steps and change nothing else.
    pub async fn handle_order_paid(&self, event: OrderPaid) -> BillingResult<Subscription> {
        match self.resolve(&event.subscription, event.user_id).await? {
            None => self.create_from_first_payment(event).await,
            Some(sub) if !sub.is_live() => Err(BillingError::InvalidTransition(format!(
                "subscription {} is cancelled",
                sub.id
            ))),
            Some(sub) => self.apply_renewal_payment(sub, event).await,
        }
    }

    /// Apply a failed payment attempt. Marks the period's invoice failed,
    /// moves the subscription to overdue and signals the notifier; dunning
    /// escalation itself is the scheduler's job.
    pub async fn handle_order_failed(&self, event: OrderFailed) -> BillingResult<Subscription> {
        let mut sub = self
            .resolve(&event.subscription, event.user_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "no live subscription for failed order {}",
                    event.order_ref
                ))
            })?;

        if !sub.is_live() {
            tracing::warn!(
                subscription_id = %sub.id,
                order_ref = %event.order_ref,
                "Ignoring payment failure for cancelled subscription"
            );
            return Ok(sub);
        }

        // Latest-timestamp-wins: a failure report older than the last
        // successful renewal belongs to an attempt that already recovered
        if let Some(last_renewal) = sub.meta.last_renewal_at {
            if event.occurred_at <= last_renewal {
                tracing::info!(
                    subscription_id = %sub.id,
                    occurred_at = %event.occurred_at,
                    last_renewal_at = %last_renewal,
                    "Ignoring stale payment failure superseded by a newer renewal"
                );
                return Ok(sub);
            }
        }

        let period_end =
            next_billing_timestamp(sub.next_renewal_at, sub.interval, sub.interval_count)?;
        let (invoice, _created) = self
            .ledger
            .create_invoice(NewInvoice {
                subscription_id: sub.id,
                user_id: sub.user_id,
                amount_cents: sub.amount_cents,
                tax_cents: 0,
                currency: sub.currency.clone(),
                status: InvoiceStatus::Failed,
                period_start: sub.next_renewal_at,
                period_end,
                due_date: sub.next_renewal_at,
                paid_at: None,
                payment_method: sub.payment_method.clone(),
                gateway_transaction_id: None,
                meta: InvoiceMeta {
                    order_ref: Some(event.order_ref.clone()),
                    points_granted: None,
                },
            })
            .await?;

        if invoice.status == InvoiceStatus::Pending {
            self.ledger.mark_failed(invoice.id).await?;
        }

        let attempt = self
            .store
            .log_payment_attempt(sub.id, invoice.id, RetryStatus::Failed, event.occurred_at)
            .await?;

        sub.failed_payment_count += 1;
        sub.last_payment_attempt = Some(event.occurred_at);
        if sub.status != SubscriptionStatus::Overdue {
            sub.status = SubscriptionStatus::Overdue;
            sub.dunning_episode += 1;
        }
        let sub = self.store.update_subscription(sub).await?;

        self.store
            .append_history(
                HistoryEntry::new(
                    sub.id,
                    HistoryAction::PaymentFailed,
                    format!("payment attempt {} failed", attempt.attempt_number),
                    Actor::System,
                    event.occurred_at,
                )
                .with_context(serde_json::json!({
                    "invoice_id": invoice.id,
                    "order_ref": event.order_ref,
                    "attempt_number": attempt.attempt_number,
                    "failed_payment_count": sub.failed_payment_count,
                })),
            )
            .await?;

        if !self
            .notifier
            .send_payment_failed(invoice.id, sub.id, &event.order_ref)
            .await
        {
            tracing::warn!(
                subscription_id = %sub.id,
                invoice_id = %invoice.id,
                "Payment-failed notification did not go out"
            );
        }

        tracing::info!(
            subscription_id = %sub.id,
            invoice_id = %invoice.id,
            failed_payment_count = sub.failed_payment_count,
            "Subscription overdue after failed payment"
        );

        Ok(sub)
    }

    /// Operator/customer pause, resume or cancel
    pub async fn apply_manual_action(&self, action: ManualAction) -> BillingResult<Subscription> {
        let mut sub = self
            .store
            .get_subscription(action.subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("subscription {}", action.subscription_id))
            })?;

        let (new_status, history_action) = match (action.action, sub.status) {
            (ManualActionKind::Pause, SubscriptionStatus::Active) => {
                (SubscriptionStatus::Paused, HistoryAction::Paused)
            }
            (ManualActionKind::Resume, SubscriptionStatus::Paused) => {
                (SubscriptionStatus::Active, HistoryAction::Resumed)
            }
            (ManualActionKind::Cancel, status) if status.is_live() => {
                (SubscriptionStatus::Cancelled, HistoryAction::Cancelled)
            }
            (kind, status) => {
                return Err(BillingError::InvalidTransition(format!(
                    "cannot {} a {} subscription",
                    kind.as_str(),
                    status
                )))
            }
        };

        sub.status = new_status;
        if new_status == SubscriptionStatus::Active {
            // A manual resume also wipes any dunning residue
            sub.dunning_level = 0;
            sub.failed_payment_count = 0;
        }
        let sub = self.store.update_subscription(sub).await?;

        self.store
            .append_history(HistoryEntry::new(
                sub.id,
                history_action,
                format!("manual {}", action.action.as_str()),
                Actor::User(action.actor_id),
                Utc::now(),
            ))
            .await?;

        tracing::info!(
            subscription_id = %sub.id,
            action = %action.action.as_str(),
            status = %sub.status,
            "Applied manual subscription action"
        );

        Ok(sub)
    }

    /// Refund a paid invoice and revoke its wallet credit
    pub async fn refund_invoice(&self, invoice_id: Uuid, actor: Actor) -> BillingResult<Invoice> {
        let invoice = self.ledger.mark_refunded(invoice_id).await?;
        let points = invoice.meta.points_granted.unwrap_or_default();

        if points > 0 {
            let key = CreditKey {
                subscription_id: invoice.subscription_id,
                invoice_id: invoice.id,
            };
            if let Err(e) = self.wallet.revoke(invoice.user_id, points, key).await {
                // The refund stands; the revoke is retried by support
                tracing::error!(
                    invoice_id = %invoice.id,
                    error = %e,
                    "Wallet revoke failed after refund"
                );
            }
        }

        self.store
            .append_history(
                HistoryEntry::new(
                    invoice.subscription_id,
                    HistoryAction::Refunded,
                    format!("invoice {} refunded", invoice.invoice_number),
                    actor,
                    Utc::now(),
                )
                .with_context(serde_json::json!({
                    "invoice_id": invoice.id,
                    "points_revoked": points,
                })),
            )
            .await?;

        Ok(invoice)
    }

    /// Replay wallet credits for paid invoices whose credit never landed.
    /// Safe to run on every tick: the wallet ledger key makes each credit
    /// at-most-once.
    pub async fn reconcile_pending_credits(&self) -> BillingResult<ReconcileSummary> {
        let pending = self.store.list_credit_pending().await?;
        let mut summary = ReconcileSummary {
            scanned: pending.len(),
            ..Default::default()
        };

        for invoice in pending {
            // Invoices created by the failure path carry no points figure;
            // fall back to the owning subscription's per-cycle grant
            let points = match invoice.meta.points_granted {
                Some(points) => points,
                None => match self.store.get_subscription(invoice.subscription_id).await? {
                    Some(sub) => sub.points_per_interval,
                    None => {
                        tracing::warn!(
                            invoice_id = %invoice.id,
                            "Credit-pending invoice has no subscription, skipping"
                        );
                        summary.still_pending += 1;
                        continue;
                    }
                },
            };
            let key = CreditKey {
                subscription_id: invoice.subscription_id,
                invoice_id: invoice.id,
            };

            match self
                .wallet
                .credit(
                    invoice.user_id,
                    points,
                    key,
                    serde_json::json!({ "reconciliation": true }),
                )
                .await
            {
                Ok(_) => {
                    self.store.set_credit_pending(invoice.id, false).await?;
                    self.store
                        .append_history(HistoryEntry::new(
                            invoice.subscription_id,
                            HistoryAction::CreditReconciled,
                            format!("wallet credit recovered for {}", invoice.invoice_number),
                            Actor::System,
                            Utc::now(),
                        ))
                        .await?;
                    summary.reconciled += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        invoice_id = %invoice.id,
                        error = %e,
                        "Wallet credit still failing, will retry next pass"
                    );
                    summary.still_pending += 1;
                }
            }
        }

        if summary.scanned > 0 {
            tracing::info!(
                scanned = summary.scanned,
                reconciled = summary.reconciled,
                still_pending = summary.still_pending,
                "Credit reconciliation pass complete"
            );
        }

        Ok(summary)
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Subscription> {
        self.store
            .get_subscription(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", id)))
    }

    async fn resolve(
        &self,
        subscription: &SubscriptionRef,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        match subscription {
            SubscriptionRef::Id(id) => {
                let sub = self
                    .store
                    .get_subscription(*id)
                    .await?
                    .ok_or_else(|| BillingError::NotFound(format!("subscription {}", id)))?;
                Ok(Some(sub))
            }
            SubscriptionRef::PlanKey(key) => self.store.find_live_subscription(user_id, key).await,
        }
    }

    async fn create_from_first_payment(&self, event: OrderPaid) -> BillingResult<Subscription> {
        let plan_key = match &event.subscription {
            SubscriptionRef::PlanKey(key) => key.clone(),
            // resolve() errors on an unknown id before we get here
            SubscriptionRef::Id(id) => {
                return Err(BillingError::NotFound(format!("subscription {}", id)))
            }
        };

        let plan = self
            .plans
            .get(&plan_key)
            .ok_or_else(|| BillingError::NotFound(format!("plan '{}'", plan_key)))?;

        let next_renewal =
            next_billing_timestamp(event.paid_at, plan.interval, plan.interval_count)?;

        let sub = self
            .store
            .insert_subscription(Subscription {
                id: Uuid::new_v4(),
                user_id: event.user_id,
                plan_key: plan.key.clone(),
                points_per_interval: plan.points_per_interval,
                interval: plan.interval,
                interval_count: plan.interval_count,
                amount_cents: event.amount_cents,
                currency: event.currency.clone(),
                status: SubscriptionStatus::Active,
                next_renewal_at: next_renewal,
                last_payment_attempt: Some(event.paid_at),
                failed_payment_count: 0,
                dunning_level: 0,
                dunning_episode: 0,
                payment_method: event.payment_method.clone(),
                meta: SubscriptionMeta {
                    plan_name: Some(plan.name.clone()),
                    last_renewal_at: Some(event.paid_at),
                    interval_count: Some(plan.interval_count),
                    reminders_sent: ReminderFlags::default(),
                },
                version: 0,
                created_at: event.paid_at,
                updated_at: event.paid_at,
            })
            .await?;

        let invoice = self
            .settle_period_invoice(&sub, &event, event.paid_at, next_renewal)
            .await?;

        self.store
            .append_history(
                HistoryEntry::new(
                    sub.id,
                    HistoryAction::Created,
                    format!("subscription created from order {}", event.order_ref),
                    Actor::System,
                    event.paid_at,
                )
                .with_context(serde_json::json!({
                    "invoice_id": invoice.id,
                    "plan_key": sub.plan_key,
                    "points": sub.points_per_interval,
                })),
            )
            .await?;

        tracing::info!(
            subscription_id = %sub.id,
            user_id = %sub.user_id,
            plan_key = %sub.plan_key,
            next_renewal_at = %sub.next_renewal_at,
            "Subscription created from first payment"
        );

        Ok(sub)
    }

    async fn apply_renewal_payment(
        &self,
        mut sub: Subscription,
        event: OrderPaid,
    ) -> BillingResult<Subscription> {
        // Replay of a payment we already applied: re-run the idempotent
        // invoice/credit steps against the period that covers it and stop
        if let Some(last_renewal) = sub.meta.last_renewal_at {
            if event.paid_at <= last_renewal {
                if let Some(invoice) = self
                    .store
                    .find_invoice_covering(sub.id, event.paid_at)
                    .await?
                {
                    self.ledger
                        .mark_paid(
                            invoice.id,
                            event.paid_at,
                            event.gateway_transaction_id.as_deref(),
                        )
                        .await?;
                    self.credit_for_invoice(&sub, &invoice).await?;
                } else {
                    tracing::warn!(
                        subscription_id = %sub.id,
                        paid_at = %event.paid_at,
                        "Replayed payment matches no billing period, ignoring"
                    );
                }
                return Ok(sub);
            }
        }

        let due = sub.next_renewal_at;
        let period_end = next_billing_timestamp(due, sub.interval, sub.interval_count)?;
        let invoice = self
            .settle_period_invoice(&sub, &event, due, period_end)
            .await?;

        let recovered = sub.status == SubscriptionStatus::Overdue;

        // Anchor the next cycle on the actual payment time so a late
        // payment doesn't shorten the period the customer paid for
        sub.next_renewal_at =
            next_billing_timestamp(event.paid_at, sub.interval, sub.interval_count)?;
        sub.status = SubscriptionStatus::Active;
        sub.failed_payment_count = 0;
        sub.dunning_level = 0;
        sub.last_payment_attempt = Some(event.paid_at);
        sub.meta.last_renewal_at = Some(event.paid_at);
        sub.meta.reminders_sent = ReminderFlags::default();
        if event.payment_method.is_some() {
            sub.payment_method = event.payment_method.clone();
        }
        let sub = self.store.update_subscription(sub).await?;

        self.store
            .append_history(
                HistoryEntry::new(
                    sub.id,
                    HistoryAction::Renewed,
                    if recovered {
                        format!("recovered via order {}", event.order_ref)
                    } else {
                        format!("renewed via order {}", event.order_ref)
                    },
                    Actor::System,
                    event.paid_at,
                )
                .with_context(serde_json::json!({
                    "invoice_id": invoice.id,
                    "next_renewal_at": sub.next_renewal_at,
                    "recovered": recovered,
                })),
            )
            .await?;

        tracing::info!(
            subscription_id = %sub.id,
            invoice_id = %invoice.id,
            next_renewal_at = %sub.next_renewal_at,
            recovered = recovered,
            "Subscription renewed"
        );

        Ok(sub)
    }

    /// Create-or-fetch the period's invoice, make sure it is paid, and
    /// credit the wallet exactly once.
    async fn settle_period_invoice(
        &self,
        sub: &Subscription,
        event: &OrderPaid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> BillingResult<Invoice> {
        let (invoice, _created) = self
            .ledger
            .create_invoice(NewInvoice {
                subscription_id: sub.id,
                user_id: sub.user_id,
                amount_cents: event.amount_cents,
                tax_cents: event.tax_cents,
                currency: event.currency.clone(),
                status: InvoiceStatus::Paid,
                period_start,
                period_end,
                due_date: period_start,
                paid_at: Some(event.paid_at),
                payment_method: event.payment_method.clone(),
                gateway_transaction_id: event.gateway_transaction_id.clone(),
                meta: InvoiceMeta {
                    order_ref: Some(event.order_ref.clone()),
                    points_granted: Some(sub.points_per_interval),
                },
            })
            .await?;

        // If the invoice pre-existed from a failed attempt this settles it
        let outcome = self
            .ledger
            .mark_paid(
                invoice.id,
                event.paid_at,
                event.gateway_transaction_id.as_deref(),
            )
            .await?;
        let invoice = outcome.invoice().clone();

        self.store
            .log_payment_attempt(sub.id, invoice.id, RetryStatus::Succeeded, event.paid_at)
            .await?;

        self.credit_for_invoice(sub, &invoice).await?;
        Ok(invoice)
    }

    /// Credit the wallet for a paid invoice. A gateway failure marks the
    /// invoice for reconciliation instead of propagating: the invoice
    /// stays paid and the credit is replayed by the next sweep.
    async fn credit_for_invoice(&self, sub: &Subscription, invoice: &Invoice) -> BillingResult<()> {
        let points = invoice
            .meta
            .points_granted
            .unwrap_or(sub.points_per_interval);
        let key = CreditKey {
            subscription_id: sub.id,
            invoice_id: invoice.id,
        };

        match self
            .wallet
            .credit(
                sub.user_id,
                points,
                key,
                serde_json::json!({
                    "plan_key": sub.plan_key,
                    "invoice_number": invoice.invoice_number,
                }),
            )
            .await
        {
            Ok(_) => {
                if invoice.credit_pending {
                    self.store.set_credit_pending(invoice.id, false).await?;
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    subscription_id = %sub.id,
                    invoice_id = %invoice.id,
                    error = %e,
                    "Wallet credit failed, flagging invoice for reconciliation"
                );
                self.store.set_credit_pending(invoice.id, true).await?;
                self.store
                    .append_history(
                        HistoryEntry::new(
                            sub.id,
                            HistoryAction::CreditPending,
                            format!("wallet credit deferred for {}", invoice.invoice_number),
                            Actor::System,
                            Utc::now(),
                        )
                        .with_context(serde_json::json!({ "invoice_id": invoice.id })),
                    )
                    .await?;
                Ok(())
            }
        }
    }
}
