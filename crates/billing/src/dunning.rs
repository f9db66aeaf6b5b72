//! Payment retry & dunning scheduler
//!
//! Runs once per external tick. Walks overdue subscriptions, advances
//! each one level-by-level through the configured dunning schedule, sends
//! the matching e-mails, and cancels at the terminal level. Every
//! escalation is a per-row compare-and-swap keyed on (episode, level), so
//! a customer payment landing mid-tick wins and is never clobbered.
//!
//! Ticks may overlap: the (subscription, episode, level) uniqueness of
//! e-mail records means a slow tick and its successor send at most one
//! e-mail per level between them.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{AutomationGuardrails, DunningConfig, TERMINAL_DUNNING_LEVEL};
use crate::error::BillingResult;
use crate::history::{Actor, HistoryAction, HistoryEntry};
use crate::notify::Notifier;
use crate::store::BillingStore;
use crate::subscriptions::Subscription;

/// A sent dunning e-mail, unique per (subscription, episode, level)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DunningEmail {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub invoice_id: Uuid,
    pub user_id: Uuid,
    /// Overdue episode the e-mail belongs to
    pub episode: i32,
    /// Dunning level (1-4)
    pub level: i16,
    pub email_type: String,
    pub sent_at: DateTime<Utc>,
    // Engagement, filled in by the e-mail provider's callbacks
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub converted_at: Option<DateTime<Utc>>,
}

/// Template name for a dunning level
pub fn email_type_for_level(level: i16) -> &'static str {
    match level {
        1 => "payment_failed",
        2 => "second_notice",
        3 => "final_warning",
        _ => "cancellation",
    }
}

/// What happened to one subscription during a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionOutcome {
    /// No level was due yet
    NotDue,
    /// Advanced one or more levels
    Escalated,
    /// Reached the terminal level and was cancelled
    Cancelled,
    /// A guardrail suppressed sending; state untouched
    Suppressed,
    /// E-mail delivery failed; state untouched, retried next tick
    SendFailed,
    /// A concurrent transition (recovery, manual action) won the race
    LostRace,
}

/// Counters for one dunning tick
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TickSummary {
    pub scanned: usize,
    pub escalated: usize,
    pub cancelled: usize,
    pub suppressed: usize,
    pub send_failures: usize,
    pub lost_races: usize,
    pub errors: usize,
    /// True when the soft budget expired before the scan finished; the
    /// remainder is picked up by the next tick
    pub stopped_early: bool,
}

/// The dunning scheduler
pub struct DunningScheduler {
    store: Arc<dyn BillingStore>,
    notifier: Arc<dyn Notifier>,
}

impl DunningScheduler {
    pub fn new(store: Arc<dyn BillingStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Process every overdue subscription once.
    ///
    /// `soft_budget` bounds wall-clock time; stopping early is safe
    /// because nothing in a tick depends on having seen the whole table.
    pub async fn run_tick(
        &self,
        now: DateTime<Utc>,
        config: &DunningConfig,
        guardrails: &AutomationGuardrails,
        soft_budget: Option<std::time::Duration>,
    ) -> BillingResult<TickSummary> {
        let started = Instant::now();
        let overdue = self.store.list_overdue_subscriptions().await?;
        let mut summary = TickSummary::default();

        for sub in overdue {
            if let Some(budget) = soft_budget {
                if started.elapsed() >= budget {
                    summary.stopped_early = true;
                    tracing::warn!(
                        scanned = summary.scanned,
                        "Dunning tick hit its soft budget, resuming next tick"
                    );
                    break;
                }
            }

            summary.scanned += 1;
            match self
                .process_subscription(&sub, now, config, guardrails)
                .await
            {
                Ok(SubscriptionOutcome::NotDue) => {}
                Ok(SubscriptionOutcome::Escalated) => summary.escalated += 1,
                Ok(SubscriptionOutcome::Cancelled) => {
                    summary.escalated += 1;
                    summary.cancelled += 1;
                }
                Ok(SubscriptionOutcome::Suppressed) => summary.suppressed += 1,
                Ok(SubscriptionOutcome::SendFailed) => summary.send_failures += 1,
                Ok(SubscriptionOutcome::LostRace) => summary.lost_races += 1,
                // One bad subscription must not stop the scan
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(
                        subscription_id = %sub.id,
                        error = %e,
                        "Dunning processing failed for subscription"
                    );
                }
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            escalated = summary.escalated,
            cancelled = summary.cancelled,
            suppressed = summary.suppressed,
            send_failures = summary.send_failures,
            lost_races = summary.lost_races,
            errors = summary.errors,
            stopped_early = summary.stopped_early,
            "Dunning tick complete"
        );

        Ok(summary)
    }

    /// Escalate one subscription as far as its elapsed time allows,
    /// one level at a time so no level is ever skipped.
    async fn process_subscription(
        &self,
        sub: &Subscription,
        now: DateTime<Utc>,
        config: &DunningConfig,
        guardrails: &AutomationGuardrails,
    ) -> BillingResult<SubscriptionOutcome> {
        let anchor = sub.last_payment_attempt.unwrap_or(sub.updated_at);
        let elapsed = now - anchor;

        let mut current_level = sub.dunning_level;
        let mut outcome = SubscriptionOutcome::NotDue;

        loop {
            let Some(next) = config.next_enabled_level(current_level) else {
                return Ok(outcome);
            };
            if elapsed < next.delay {
                return Ok(outcome);
            }

            if let Some(suppressed) = self.check_guardrails(sub, now, guardrails).await? {
                // Suppression intentionally leaves the level alone so the
                // escalation resumes once the guardrail clears
                return Ok(if outcome == SubscriptionOutcome::NotDue {
                    suppressed
                } else {
                    outcome
                });
            }

            let Some(invoice) = self
                .store
                .find_invoice_covering(sub.id, sub.next_renewal_at)
                .await?
            else {
                tracing::warn!(
                    subscription_id = %sub.id,
                    "Overdue subscription has no invoice for its due period"
                );
                return Ok(outcome);
            };

            let email = DunningEmail {
                id: Uuid::new_v4(),
                subscription_id: sub.id,
                invoice_id: invoice.id,
                user_id: sub.user_id,
                episode: sub.dunning_episode,
                level: next.level,
                email_type: email_type_for_level(next.level).to_string(),
                sent_at: now,
                opened_at: None,
                clicked_at: None,
                converted_at: None,
            };
            let email_id = email.id;

            // Claim the (episode, level) slot before sending; if another
            // tick already holds it we only need to catch up the level
            let claimed = self.store.record_dunning_email(email).await?;
            if claimed {
                if !self
                    .notifier
                    .send_dunning_email(invoice.id, next.level)
                    .await
                {
                    // Release the slot so the level is retried next tick
                    self.store.delete_dunning_email(email_id).await?;
                    tracing::warn!(
                        subscription_id = %sub.id,
                        level = next.level,
                        "Dunning e-mail failed to send, level not advanced"
                    );
                    return Ok(if outcome == SubscriptionOutcome::NotDue {
                        SubscriptionOutcome::SendFailed
                    } else {
                        outcome
                    });
                }
            }

            let cancel = next.level >= TERMINAL_DUNNING_LEVEL;
            let advanced = self
                .store
                .escalate_dunning(
                    sub.id,
                    sub.dunning_episode,
                    current_level,
                    next.level,
                    cancel,
                    now,
                )
                .await?;
            if !advanced {
                tracing::info!(
                    subscription_id = %sub.id,
                    level = next.level,
                    "Skipping escalation, subscription changed concurrently"
                );
                return Ok(if outcome == SubscriptionOutcome::NotDue {
                    SubscriptionOutcome::LostRace
                } else {
                    outcome
                });
            }

            let (action, note) = if cancel {
                (
                    HistoryAction::CancelledByDunning,
                    format!("cancelled after reaching dunning level {}", next.level),
                )
            } else {
                (
                    HistoryAction::DunningLevelAdvanced,
                    format!("dunning level {} -> {}", current_level, next.level),
                )
            };
            self.store
                .append_history(
                    HistoryEntry::new(sub.id, action, note, Actor::System, now).with_context(
                        serde_json::json!({
                            "invoice_id": invoice.id,
                            "level": next.level,
                            "episode": sub.dunning_episode,
                        }),
                    ),
                )
                .await?;

            tracing::info!(
                subscription_id = %sub.id,
                level = next.level,
                cancelled = cancel,
                "Dunning level advanced"
            );

            if cancel {
                return Ok(SubscriptionOutcome::Cancelled);
            }
            outcome = SubscriptionOutcome::Escalated;
            current_level = next.level;
        }
    }

    async fn check_guardrails(
        &self,
        sub: &Subscription,
        now: DateTime<Utc>,
        guardrails: &AutomationGuardrails,
    ) -> BillingResult<Option<SubscriptionOutcome>> {
        if !guardrails.automation_enabled {
            return Ok(Some(SubscriptionOutcome::Suppressed));
        }

        if sub.amount_cents < guardrails.min_amount_cents {
            tracing::debug!(
                subscription_id = %sub.id,
                amount_cents = sub.amount_cents,
                "Below minimum amount, dunning suppressed"
            );
            return Ok(Some(SubscriptionOutcome::Suppressed));
        }

        let role = self.store.user_role(sub.user_id).await?;
        if guardrails.role_excluded(role.as_deref()) {
            tracing::debug!(
                subscription_id = %sub.id,
                role = ?role,
                "User role excluded from dunning automation"
            );
            return Ok(Some(SubscriptionOutcome::Suppressed));
        }

        if guardrails.max_emails_per_day > 0 {
            let sent_today = self
                .store
                .count_dunning_emails_since(now - Duration::hours(24))
                .await?;
            if sent_today >= u64::from(guardrails.max_emails_per_day) {
                tracing::warn!(
                    sent_today = sent_today,
                    cap = guardrails.max_emails_per_day,
                    "Daily dunning e-mail cap reached, suppressing sends"
                );
                return Ok(Some(SubscriptionOutcome::Suppressed));
            }
        }

        Ok(None)
    }
}
