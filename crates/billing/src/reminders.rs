//! Renewal reminder pass
//!
//! A simpler, non-escalating counterpart to the dunning scheduler: active
//! subscriptions get an upcoming-renewal e-mail 3 days and 1 day before
//! `next_renewal_at`. Sends are tracked per cycle in subscription meta
//! (cleared on every successful renewal), so the pass is idempotent per
//! (subscription, cycle, window).

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::ReminderConfig;
use crate::error::BillingResult;
use crate::notify::Notifier;
use crate::store::BillingStore;
use crate::subscriptions::Subscription;

/// Counters for one reminder pass
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReminderSummary {
    pub scanned: usize,
    pub sent: usize,
    pub send_failures: usize,
    pub errors: usize,
}

/// The renewal reminder service
pub struct ReminderService {
    store: Arc<dyn BillingStore>,
    notifier: Arc<dyn Notifier>,
}

impl ReminderService {
    pub fn new(store: Arc<dyn BillingStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Send due reminders for every active subscription renewing soon.
    pub async fn run_pass(
        &self,
        now: DateTime<Utc>,
        config: &ReminderConfig,
    ) -> BillingResult<ReminderSummary> {
        let horizon = config.days_before.iter().copied().max().unwrap_or(0);
        let cutoff = now + Duration::days(i64::from(horizon));
        let renewing = self.store.list_active_renewing_before(cutoff).await?;

        let mut summary = ReminderSummary {
            scanned: renewing.len(),
            ..Default::default()
        };

        for sub in renewing {
            match self.process_subscription(sub, now, config).await {
                Ok(Some(true)) => summary.sent += 1,
                Ok(Some(false)) => summary.send_failures += 1,
                Ok(None) => {}
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(error = %e, "Reminder processing failed for subscription");
                }
            }
        }

        if summary.scanned > 0 {
            tracing::info!(
                scanned = summary.scanned,
                sent = summary.sent,
                send_failures = summary.send_failures,
                errors = summary.errors,
                "Renewal reminder pass complete"
            );
        }

        Ok(summary)
    }

    /// Pick the applicable window for this subscription, if any, and send
    /// at most one reminder. Returns Some(send-succeeded) when a send was
    /// attempted.
    async fn process_subscription(
        &self,
        mut sub: Subscription,
        now: DateTime<Utc>,
        config: &ReminderConfig,
    ) -> BillingResult<Option<bool>> {
        let time_left = sub.next_renewal_at - now;
        if time_left <= Duration::zero() {
            // Past due; renewal (or dunning) will sort this out
            return Ok(None);
        }

        // Windows are disjoint: the 3-day reminder belongs to (1d, 3d],
        // the 1-day reminder to (0, 1d]. Ascending order picks the
        // tightest applicable window.
        let mut windows: Vec<u32> = config.days_before.clone();
        windows.sort_unstable();

        let mut lower = Duration::zero();
        for days in windows {
            let upper = Duration::days(i64::from(days));
            let applicable = time_left > lower && time_left <= upper;
            lower = upper;

            if !applicable || sub.meta.reminders_sent.sent(days) {
                continue;
            }

            if !self.notifier.send_renewal_reminder(sub.id, days).await {
                // Flag stays unset so the next pass retries
                tracing::warn!(
                    subscription_id = %sub.id,
                    days_before = days,
                    "Renewal reminder failed to send"
                );
                return Ok(Some(false));
            }

            sub.meta.reminders_sent.mark_sent(days);
            let sub = self.store.update_subscription(sub).await?;

            tracing::info!(
                subscription_id = %sub.id,
                days_before = days,
                next_renewal_at = %sub.next_renewal_at,
                "Renewal reminder sent"
            );
            return Ok(Some(true));
        }

        Ok(None)
    }
}
