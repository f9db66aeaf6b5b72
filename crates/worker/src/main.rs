//! Pointbill Billing Worker
//!
//! The billing tick driver. Handles scheduled jobs including:
//! - Dunning tick over overdue subscriptions (every 15 minutes)
//! - Renewal reminder pass (hourly)
//! - Wallet credit reconciliation (hourly)
//! - Billing invariant sweep (daily at 5:00 UTC)
//! - Dunning e-mail retention cleanup (daily at 4:00 AM UTC)
//!
//! The engine itself has no scheduling opinion; every job here just
//! invokes an idempotent engine pass with an explicit configuration, so
//! overlapping or missed firings are harmless.

use std::sync::Arc;
use std::time::Duration;

use pointbill_billing::{
    AutomationGuardrails, DunningConfig, DunningScheduler, EmailNotifier, InvariantChecker,
    Notifier, PgBillingStore, PgWalletLedger, PlanCatalog, ReminderConfig, ReminderService,
    SubscriptionService,
};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Dunning schedule from environment overrides, defaults otherwise
fn load_dunning_config() -> DunningConfig {
    let mut config = DunningConfig::default();

    for level in 1..=4i16 {
        if let Ok(raw) = std::env::var(format!("DUNNING_LEVEL_{}_DELAY", level)) {
            config.set_delay_from_str(level, &raw);
        }
        if let Ok(raw) = std::env::var(format!("DUNNING_LEVEL_{}_ENABLED", level)) {
            if let Some(cfg) = config.levels.iter_mut().find(|l| l.level == level) {
                cfg.enabled = raw.trim().parse().unwrap_or(true);
            }
        }
    }

    config
}

/// Automation guardrails from environment
fn load_guardrails() -> AutomationGuardrails {
    let defaults = AutomationGuardrails::default();

    AutomationGuardrails {
        automation_enabled: std::env::var("DUNNING_AUTOMATION_ENABLED")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.automation_enabled),
        max_emails_per_day: std::env::var("DUNNING_MAX_EMAILS_PER_DAY")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.max_emails_per_day),
        excluded_roles: std::env::var("DUNNING_EXCLUDED_ROLES")
            .map(|v| {
                v.split(',')
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.excluded_roles),
        min_amount_cents: std::env::var("DUNNING_MIN_AMOUNT_CENTS")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.min_amount_cents),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Pointbill Worker");

    // Create database pool and apply pending migrations
    let pool = create_db_pool().await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;

    // Wire up the engine components. The worker never consumes signup
    // orders, so the plan catalog stays empty here.
    let store = Arc::new(PgBillingStore::new(pool.clone()));
    let wallet = Arc::new(PgWalletLedger::new(pool.clone()));
    let notifier: Arc<dyn Notifier> = Arc::new(EmailNotifier::from_env());
    let dunning = Arc::new(DunningScheduler::new(store.clone(), notifier.clone()));
    let reminders = Arc::new(ReminderService::new(store.clone(), notifier.clone()));
    let subscriptions = Arc::new(SubscriptionService::new(
        store,
        wallet,
        notifier,
        PlanCatalog::default(),
    ));

    let dunning_config = load_dunning_config();
    let guardrails = load_guardrails();
    let tick_budget = std::env::var("DUNNING_TICK_BUDGET_SECS")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(300));

    info!(
        automation_enabled = guardrails.automation_enabled,
        max_emails_per_day = guardrails.max_emails_per_day,
        min_amount_cents = guardrails.min_amount_cents,
        tick_budget_secs = tick_budget.as_secs(),
        "Dunning configuration loaded"
    );

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Dunning tick (every 15 minutes)
    // Walks overdue subscriptions and advances their dunning levels
    let tick_dunning = dunning.clone();
    let tick_config = dunning_config.clone();
    let tick_guardrails = guardrails.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let dunning = tick_dunning.clone();
            let config = tick_config.clone();
            let guardrails = tick_guardrails.clone();
            Box::pin(async move {
                info!("Running dunning tick");
                match dunning
                    .run_tick(chrono::Utc::now(), &config, &guardrails, Some(tick_budget))
                    .await
                {
                    Ok(summary) => {
                        if summary.errors > 0 || summary.send_failures > 0 {
                            warn!(
                                escalated = summary.escalated,
                                cancelled = summary.cancelled,
                                errors = summary.errors,
                                send_failures = summary.send_failures,
                                "Dunning tick finished with failures"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Dunning tick failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Dunning tick (every 15 minutes)");

    // Job 2: Renewal reminder pass (hourly)
    let pass_reminders = reminders.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let reminders = pass_reminders.clone();
            Box::pin(async move {
                info!("Running renewal reminder pass");
                if let Err(e) = reminders
                    .run_pass(chrono::Utc::now(), &ReminderConfig::default())
                    .await
                {
                    error!(error = %e, "Renewal reminder pass failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Renewal reminder pass (hourly)");

    // Job 3: Wallet credit reconciliation (hourly, offset from reminders)
    // Replays credits for paid invoices whose wallet grant never landed
    let reconcile_subs = subscriptions.clone();
    scheduler
        .add(Job::new_async("0 30 * * * *", move |_uuid, _l| {
            let subscriptions = reconcile_subs.clone();
            Box::pin(async move {
                match subscriptions.reconcile_pending_credits().await {
                    Ok(summary) if summary.still_pending > 0 => {
                        warn!(
                            still_pending = summary.still_pending,
                            "Wallet credits still unreconciled after sweep"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Credit reconciliation failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Wallet credit reconciliation (hourly)");

    // Job 4: Billing invariant sweep (daily at 5:00 UTC)
    let invariant_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 5 * * *", move |_uuid, _l| {
            let checker = InvariantChecker::new(invariant_pool.clone());
            Box::pin(async move {
                info!("Running billing invariant sweep");
                match checker.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks_run = summary.checks_run, "All billing invariants hold");
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Billing invariant violated"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant sweep (daily at 5:00 UTC)");

    // Job 5: Dunning e-mail retention cleanup (daily at 4:00 AM UTC)
    // Engagement data is only useful for a while; drop records older than
    // 180 days (long past any episode they could deduplicate)
    let cleanup_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let pool = cleanup_pool.clone();
            Box::pin(async move {
                info!("Running dunning e-mail cleanup");
                let result =
                    sqlx::query("DELETE FROM dunning_emails WHERE sent_at < NOW() - INTERVAL '180 days'")
                        .execute(&pool)
                        .await;

                match result {
                    Ok(r) => info!(deleted = r.rows_affected(), "Dunning e-mail cleanup complete"),
                    Err(e) => error!(error = %e, "Dunning e-mail cleanup failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Dunning e-mail cleanup (daily at 4:00 AM UTC)");

    // Job 6: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Pointbill Worker started successfully with 6 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
