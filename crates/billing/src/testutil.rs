//! Shared test fixtures: an in-memory engine wiring plus recording
//! doubles for the wallet gateway and the notifier.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::dunning::DunningScheduler;
use crate::error::{BillingError, BillingResult};
use crate::events::{OrderFailed, OrderPaid, SubscriptionRef};
use crate::invoices::{InvoiceMeta, InvoiceStatus, NewInvoice};
use crate::notify::Notifier;
use crate::reminders::ReminderService;
use crate::renewal::BillingInterval;
use crate::store::InMemoryBillingStore;
use crate::subscriptions::{Plan, PlanCatalog, SubscriptionService};
use crate::wallet::{CreditKey, WalletGateway, WalletTransaction};

// Re-export so `use crate::testutil::*` brings the store trait's methods
// into scope for assertions against the in-memory store
pub use crate::store::BillingStore;

pub fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
}

pub const PLAN_KEY: &str = "points-100-monthly";

pub fn test_plan() -> Plan {
    Plan {
        key: PLAN_KEY.to_string(),
        name: "100 points / month".to_string(),
        points_per_interval: 100,
        interval: BillingInterval::Month,
        interval_count: 1,
    }
}

pub fn new_invoice_input(start: DateTime<Utc>, end: DateTime<Utc>) -> NewInvoice {
    NewInvoice {
        subscription_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        amount_cents: 1000,
        tax_cents: 0,
        currency: "USD".to_string(),
        status: InvoiceStatus::Pending,
        period_start: start,
        period_end: end,
        due_date: start,
        paid_at: None,
        payment_method: None,
        gateway_transaction_id: None,
        meta: InvoiceMeta::default(),
    }
}

/// Wallet double with real at-most-once semantics per key
#[derive(Default)]
pub struct RecordingWallet {
    applied: Mutex<HashSet<(Uuid, Uuid, &'static str)>>,
    credits: Mutex<Vec<(Uuid, i64)>>,
    pub fail_credits: AtomicBool,
}

impl RecordingWallet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of credits that actually moved points
    pub fn applied_credits(&self) -> usize {
        self.credits.lock().unwrap().len()
    }

    pub fn credited_points(&self) -> i64 {
        self.credits.lock().unwrap().iter().map(|(_, p)| p).sum()
    }
}

#[async_trait]
impl WalletGateway for RecordingWallet {
    async fn credit(
        &self,
        user_id: Uuid,
        points: i64,
        key: CreditKey,
        _meta: Value,
    ) -> BillingResult<WalletTransaction> {
        if self.fail_credits.load(Ordering::SeqCst) {
            return Err(BillingError::WalletCredit("wallet unavailable".to_string()));
        }
        let mut applied = self.applied.lock().unwrap();
        if !applied.insert((key.subscription_id, key.invoice_id, "credit")) {
            return Ok(WalletTransaction {
                transaction_id: Uuid::new_v4(),
                applied: false,
            });
        }
        self.credits.lock().unwrap().push((user_id, points));
        Ok(WalletTransaction {
            transaction_id: Uuid::new_v4(),
            applied: true,
        })
    }

    async fn revoke(
        &self,
        _user_id: Uuid,
        _points: i64,
        key: CreditKey,
    ) -> BillingResult<WalletTransaction> {
        let mut applied = self.applied.lock().unwrap();
        let first = applied.insert((key.subscription_id, key.invoice_id, "revoke"));
        Ok(WalletTransaction {
            transaction_id: Uuid::new_v4(),
            applied: first,
        })
    }
}

/// Notifier double that records every send
#[derive(Default)]
pub struct RecordingNotifier {
    pub dunning: Mutex<Vec<(Uuid, i16)>>,
    pub reminders: Mutex<Vec<(Uuid, u32)>>,
    pub payment_failures: Mutex<Vec<Uuid>>,
    pub fail_dunning: AtomicBool,
    pub fail_reminders: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dunning_sent(&self) -> Vec<(Uuid, i16)> {
        self.dunning.lock().unwrap().clone()
    }

    pub fn reminders_sent(&self) -> Vec<(Uuid, u32)> {
        self.reminders.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_dunning_email(&self, invoice_id: Uuid, level: i16) -> bool {
        if self.fail_dunning.load(Ordering::SeqCst) {
            return false;
        }
        self.dunning.lock().unwrap().push((invoice_id, level));
        true
    }

    async fn send_renewal_reminder(&self, subscription_id: Uuid, days_before: u32) -> bool {
        if self.fail_reminders.load(Ordering::SeqCst) {
            return false;
        }
        self.reminders
            .lock()
            .unwrap()
            .push((subscription_id, days_before));
        true
    }

    async fn send_payment_failed(
        &self,
        invoice_id: Uuid,
        _subscription_id: Uuid,
        _order_ref: &str,
    ) -> bool {
        self.payment_failures.lock().unwrap().push(invoice_id);
        true
    }
}

/// Fully wired engine over the in-memory store
pub struct TestEngine {
    pub store: Arc<InMemoryBillingStore>,
    pub wallet: Arc<RecordingWallet>,
    pub notifier: Arc<RecordingNotifier>,
    pub subscriptions: SubscriptionService,
    pub dunning: DunningScheduler,
    pub reminders: ReminderService,
}

impl TestEngine {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryBillingStore::new());
        let wallet = Arc::new(RecordingWallet::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let subscriptions = SubscriptionService::new(
            store.clone(),
            wallet.clone(),
            notifier.clone(),
            PlanCatalog::new(vec![test_plan()]),
        );
        let dunning = DunningScheduler::new(store.clone(), notifier.clone());
        let reminders = ReminderService::new(store.clone(), notifier.clone());
        Self {
            store,
            wallet,
            notifier,
            subscriptions,
            dunning,
            reminders,
        }
    }
}

pub fn paid_for_plan(user_id: Uuid, paid_at: DateTime<Utc>, order_ref: &str) -> OrderPaid {
    OrderPaid {
        subscription: SubscriptionRef::PlanKey(PLAN_KEY.to_string()),
        user_id,
        amount_cents: 1000,
        tax_cents: 0,
        currency: "USD".to_string(),
        paid_at,
        payment_method: Some("card".to_string()),
        gateway_transaction_id: Some(format!("txn_{}", order_ref)),
        order_ref: order_ref.to_string(),
    }
}

pub fn paid_for_sub(
    subscription_id: Uuid,
    user_id: Uuid,
    paid_at: DateTime<Utc>,
    order_ref: &str,
) -> OrderPaid {
    OrderPaid {
        subscription: SubscriptionRef::Id(subscription_id),
        user_id,
        amount_cents: 1000,
        tax_cents: 0,
        currency: "USD".to_string(),
        paid_at,
        payment_method: Some("card".to_string()),
        gateway_transaction_id: Some(format!("txn_{}", order_ref)),
        order_ref: order_ref.to_string(),
    }
}

pub fn failed_for_sub(
    subscription_id: Uuid,
    user_id: Uuid,
    occurred_at: DateTime<Utc>,
    order_ref: &str,
) -> OrderFailed {
    OrderFailed {
        subscription: SubscriptionRef::Id(subscription_id),
        user_id,
        order_ref: order_ref.to_string(),
        occurred_at,
    }
}
