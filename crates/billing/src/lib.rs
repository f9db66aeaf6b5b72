// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Store trait operations carry full row context
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Pointbill Billing Engine
//!
//! Turns recurring "order paid / order failed" events from the commerce
//! layer into wallet point credits, tracks renewal dates, and escalates
//! unpaid invoices through a dunning sequence.
//!
//! ## Features
//!
//! - **Subscription State Machine**: active / paused / overdue /
//!   cancelled lifecycle driven by payment events and manual actions
//! - **Invoice Ledger**: one invoice per billing period, idempotent
//!   creation, paid invoices immutable outside refunds
//! - **Wallet Crediting**: at-most-once point credits keyed by
//!   (subscription, invoice), self-healing via reconciliation
//! - **Dunning Scheduler**: tick-driven escalation with per-level
//!   schedules, guardrails and compare-and-swap safety
//! - **Renewal Reminders**: 3-day and 1-day upcoming-renewal e-mails,
//!   idempotent per cycle
//! - **Invariants**: runnable SQL consistency checks
//!
//! Duplicate event delivery and overlapping ticks are first-class
//! concerns; see the module docs for how each path stays idempotent.

pub mod config;
pub mod dunning;
pub mod error;
pub mod events;
pub mod history;
pub mod invariants;
pub mod invoices;
pub mod notify;
pub mod pg_store;
pub mod reminders;
pub mod renewal;
pub mod retries;
pub mod store;
pub mod subscriptions;
pub mod wallet;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
pub(crate) mod testutil;

// Config
pub use config::{
    parse_delay, AutomationGuardrails, DunningConfig, DunningLevelConfig, ReminderConfig,
    TERMINAL_DUNNING_LEVEL,
};

// Dunning
pub use dunning::{DunningEmail, DunningScheduler, TickSummary};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{ManualAction, ManualActionKind, OrderFailed, OrderPaid, SubscriptionRef};

// History
pub use history::{Actor, HistoryAction, HistoryEntry};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Invoices
pub use invoices::{
    Invoice, InvoiceLedger, InvoiceMeta, InvoiceStatus, MarkPaidOutcome, NewInvoice,
};

// Notifications
pub use notify::{EmailNotifier, Notifier};

// Renewal
pub use renewal::{next_billing_timestamp, BillingInterval};

// Retries
pub use retries::{PaymentRetry, RetryStatus};

// Reminders
pub use reminders::{ReminderService, ReminderSummary};

// Store
pub use pg_store::PgBillingStore;
pub use store::{BillingStore, InMemoryBillingStore};

// Subscriptions
pub use subscriptions::{
    Plan, PlanCatalog, ReconcileSummary, ReminderFlags, Subscription, SubscriptionMeta,
    SubscriptionService, SubscriptionStatus,
};

// Wallet
pub use wallet::{CreditKey, PgWalletLedger, WalletGateway, WalletTransaction};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing engine that combines all billing functionality
pub struct BillingEngine {
    pub subscriptions: SubscriptionService,
    pub dunning: DunningScheduler,
    pub reminders: ReminderService,
}

impl BillingEngine {
    /// Create a Postgres-backed engine with the e-mail notifier
    /// configured from environment variables
    pub fn from_env(pool: PgPool, plans: PlanCatalog) -> Self {
        let notifier: Arc<dyn Notifier> = Arc::new(EmailNotifier::from_env());
        let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool.clone()));
        let wallet: Arc<dyn WalletGateway> = Arc::new(PgWalletLedger::new(pool));
        Self::with_components(store, wallet, notifier, plans)
    }

    /// Create an engine from explicit components (custom stores,
    /// alternate notifiers, test doubles)
    pub fn with_components(
        store: Arc<dyn BillingStore>,
        wallet: Arc<dyn WalletGateway>,
        notifier: Arc<dyn Notifier>,
        plans: PlanCatalog,
    ) -> Self {
        Self {
            subscriptions: SubscriptionService::new(
                store.clone(),
                wallet,
                notifier.clone(),
                plans,
            ),
            dunning: DunningScheduler::new(store.clone(), notifier.clone()),
            reminders: ReminderService::new(store, notifier),
        }
    }
}
