// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Engine
//!
//! Covers boundary conditions and race outcomes across components:
//! - Subscription lifecycle (creation, renewal, replay, manual actions)
//! - Failure handling and recovery
//! - Dunning escalation, guardrails and e-mail dedup
//! - Renewal reminders
//! - Wallet credit reconciliation

#[cfg(test)]
mod lifecycle_tests {
    use crate::events::ManualActionKind;
    use crate::history::HistoryAction;
    use crate::invoices::InvoiceStatus;
    use crate::subscriptions::SubscriptionStatus;
    use crate::testutil::*;
    use crate::{BillingError, ManualAction};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_first_payment_creates_active_subscription() {
        let engine = TestEngine::new();
        let user = Uuid::new_v4();

        let sub = engine
            .subscriptions
            .handle_order_paid(paid_for_plan(user, utc(2024, 1, 15), "order-1"))
            .await
            .unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.points_per_interval, 100);
        assert_eq!(sub.next_renewal_at, utc(2024, 2, 15));
        assert_eq!(sub.failed_payment_count, 0);
        assert_eq!(sub.dunning_level, 0);

        // One paid invoice covering the first period
        let invoice = engine
            .store
            .find_invoice_covering(sub.id, utc(2024, 1, 20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.paid_at, Some(utc(2024, 1, 15)));

        // Wallet credited exactly once with the plan's points
        assert_eq!(engine.wallet.applied_credits(), 1);
        assert_eq!(engine.wallet.credited_points(), 100);

        let history = engine.store.list_history(sub.id).await.unwrap();
        assert!(history
            .iter()
            .any(|h| h.action == HistoryAction::Created));
    }

    #[tokio::test]
    async fn test_replayed_payment_credits_wallet_once() {
        let engine = TestEngine::new();
        let user = Uuid::new_v4();
        let event = paid_for_plan(user, utc(2024, 1, 15), "order-1");

        let first = engine
            .subscriptions
            .handle_order_paid(event.clone())
            .await
            .unwrap();
        let second = engine
            .subscriptions
            .handle_order_paid(event)
            .await
            .unwrap();

        // Same subscription, same renewal date, single credit
        assert_eq!(first.id, second.id);
        assert_eq!(second.next_renewal_at, utc(2024, 2, 15));
        assert_eq!(engine.wallet.applied_credits(), 1);
    }

    #[tokio::test]
    async fn test_renewal_advances_from_payment_timestamp() {
        let engine = TestEngine::new();
        let user = Uuid::new_v4();

        let sub = engine
            .subscriptions
            .handle_order_paid(paid_for_plan(user, utc(2024, 1, 15), "order-1"))
            .await
            .unwrap();

        // Customer pays 4 days late; the next period anchors on the
        // payment, not the old due date
        let sub = engine
            .subscriptions
            .handle_order_paid(paid_for_sub(sub.id, user, utc(2024, 2, 19), "order-2"))
            .await
            .unwrap();

        assert_eq!(sub.next_renewal_at, utc(2024, 3, 19));
        assert_eq!(engine.wallet.applied_credits(), 2);
    }

    #[tokio::test]
    async fn test_failed_renewal_goes_overdue_without_dunning() {
        let engine = TestEngine::new();
        let user = Uuid::new_v4();

        let sub = engine
            .subscriptions
            .handle_order_paid(paid_for_plan(user, utc(2024, 1, 15), "order-1"))
            .await
            .unwrap();
        let due = sub.next_renewal_at;

        let sub = engine
            .subscriptions
            .handle_order_failed(failed_for_sub(sub.id, user, due, "renewal-1"))
            .await
            .unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Overdue);
        assert_eq!(sub.failed_payment_count, 1);
        // Escalation belongs to the scheduler, not the failure path
        assert_eq!(sub.dunning_level, 0);

        let invoice = engine
            .store
            .find_invoice_covering(sub.id, due)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Failed);

        // Payment-failed signal went to the notifier
        assert_eq!(engine.notifier.payment_failures.lock().unwrap().len(), 1);
        // No wallet credit for the failed period
        assert_eq!(engine.wallet.applied_credits(), 1);
    }

    #[tokio::test]
    async fn test_retry_success_resets_counters_and_credits_once() {
        let engine = TestEngine::new();
        let user = Uuid::new_v4();

        let sub = engine
            .subscriptions
            .handle_order_paid(paid_for_plan(user, utc(2024, 1, 15), "order-1"))
            .await
            .unwrap();
        let due = sub.next_renewal_at;
        engine
            .subscriptions
            .handle_order_failed(failed_for_sub(sub.id, user, due, "renewal-1"))
            .await
            .unwrap();

        // Retry succeeds 5 days after the failure
        let sub = engine
            .subscriptions
            .handle_order_paid(paid_for_sub(sub.id, user, utc(2024, 2, 20), "retry-1"))
            .await
            .unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.failed_payment_count, 0);
        assert_eq!(sub.dunning_level, 0);

        // The failed invoice became the paid one; no duplicate row
        let invoice = engine
            .store
            .find_invoice_covering(sub.id, due)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(engine.wallet.applied_credits(), 2);

        // Attempt numbers are strictly increasing per invoice
        let attempts = engine.store.list_payment_attempts(invoice.id).await.unwrap();
        let numbers: Vec<i32> = attempts.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_stale_failure_after_success_is_ignored() {
        let engine = TestEngine::new();
        let user = Uuid::new_v4();

        let sub = engine
            .subscriptions
            .handle_order_paid(paid_for_plan(user, utc(2024, 1, 15), "order-1"))
            .await
            .unwrap();
        engine
            .subscriptions
            .handle_order_paid(paid_for_sub(sub.id, user, utc(2024, 2, 20), "order-2"))
            .await
            .unwrap();

        // A failure report for an attempt the later success superseded
        let sub = engine
            .subscriptions
            .handle_order_failed(failed_for_sub(sub.id, user, utc(2024, 2, 19), "renewal-old"))
            .await
            .unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.failed_payment_count, 0);
    }

    #[tokio::test]
    async fn test_manual_pause_resume_cancel() {
        let engine = TestEngine::new();
        let user = Uuid::new_v4();
        let actor = Uuid::new_v4();

        let sub = engine
            .subscriptions
            .handle_order_paid(paid_for_plan(user, utc(2024, 1, 15), "order-1"))
            .await
            .unwrap();

        let paused = engine
            .subscriptions
            .apply_manual_action(ManualAction {
                subscription_id: sub.id,
                action: ManualActionKind::Pause,
                actor_id: actor,
            })
            .await
            .unwrap();
        assert_eq!(paused.status, SubscriptionStatus::Paused);

        // Pausing a paused subscription is rejected
        let result = engine
            .subscriptions
            .apply_manual_action(ManualAction {
                subscription_id: sub.id,
                action: ManualActionKind::Pause,
                actor_id: actor,
            })
            .await;
        assert!(matches!(result, Err(BillingError::InvalidTransition(_))));

        let resumed = engine
            .subscriptions
            .apply_manual_action(ManualAction {
                subscription_id: sub.id,
                action: ManualActionKind::Resume,
                actor_id: actor,
            })
            .await
            .unwrap();
        assert_eq!(resumed.status, SubscriptionStatus::Active);

        let cancelled = engine
            .subscriptions
            .apply_manual_action(ManualAction {
                subscription_id: sub.id,
                action: ManualActionKind::Cancel,
                actor_id: actor,
            })
            .await
            .unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);

        // Cancellation is terminal
        let result = engine
            .subscriptions
            .apply_manual_action(ManualAction {
                subscription_id: sub.id,
                action: ManualActionKind::Cancel,
                actor_id: actor,
            })
            .await;
        assert!(matches!(result, Err(BillingError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn test_resubscribe_after_cancel_creates_new_subscription() {
        let engine = TestEngine::new();
        let user = Uuid::new_v4();

        let first = engine
            .subscriptions
            .handle_order_paid(paid_for_plan(user, utc(2024, 1, 15), "order-1"))
            .await
            .unwrap();
        engine
            .subscriptions
            .apply_manual_action(ManualAction {
                subscription_id: first.id,
                action: ManualActionKind::Cancel,
                actor_id: user,
            })
            .await
            .unwrap();

        // Paying the cancelled subscription directly is refused...
        let result = engine
            .subscriptions
            .handle_order_paid(paid_for_sub(first.id, user, utc(2024, 3, 1), "order-2"))
            .await;
        assert!(matches!(result, Err(BillingError::InvalidTransition(_))));

        // ...but a fresh signup for the plan starts a new subscription
        let second = engine
            .subscriptions
            .handle_order_paid(paid_for_plan(user, utc(2024, 3, 1), "order-3"))
            .await
            .unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(second.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_unknown_plan_is_not_found() {
        let engine = TestEngine::new();
        let mut event = paid_for_plan(Uuid::new_v4(), utc(2024, 1, 15), "order-1");
        event.subscription = crate::SubscriptionRef::PlanKey("no-such-plan".to_string());

        let result = engine.subscriptions.handle_order_paid(event).await;
        assert!(matches!(result, Err(BillingError::NotFound(_))));
    }
}

#[cfg(test)]
mod wallet_reconciliation_tests {
    use crate::history::HistoryAction;
    use crate::testutil::*;
    use std::sync::atomic::Ordering;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_wallet_outage_flags_invoice_and_reconciles() {
        let engine = TestEngine::new();
        let user = Uuid::new_v4();

        engine.wallet.fail_credits.store(true, Ordering::SeqCst);
        let sub = engine
            .subscriptions
            .handle_order_paid(paid_for_plan(user, utc(2024, 1, 15), "order-1"))
            .await
            .unwrap();

        // Invoice stays paid but is flagged; nothing was credited
        let invoice = engine
            .store
            .find_invoice_covering(sub.id, utc(2024, 1, 15))
            .await
            .unwrap()
            .unwrap();
        assert!(invoice.credit_pending);
        assert_eq!(engine.wallet.applied_credits(), 0);

        // Wallet comes back; the sweep replays the credit exactly once
        engine.wallet.fail_credits.store(false, Ordering::SeqCst);
        let summary = engine.subscriptions.reconcile_pending_credits().await.unwrap();
        assert_eq!(summary.reconciled, 1);
        assert_eq!(engine.wallet.applied_credits(), 1);
        assert_eq!(engine.wallet.credited_points(), 100);

        let invoice = engine.store.get_invoice(invoice.id).await.unwrap().unwrap();
        assert!(!invoice.credit_pending);

        let history = engine.store.list_history(sub.id).await.unwrap();
        assert!(history
            .iter()
            .any(|h| h.action == HistoryAction::CreditPending));
        assert!(history
            .iter()
            .any(|h| h.action == HistoryAction::CreditReconciled));

        // Nothing left to reconcile
        let summary = engine.subscriptions.reconcile_pending_credits().await.unwrap();
        assert_eq!(summary.scanned, 0);
    }

    #[tokio::test]
    async fn test_reconciliation_keeps_flag_while_wallet_down() {
        let engine = TestEngine::new();
        let user = Uuid::new_v4();

        engine.wallet.fail_credits.store(true, Ordering::SeqCst);
        let sub = engine
            .subscriptions
            .handle_order_paid(paid_for_plan(user, utc(2024, 1, 15), "order-1"))
            .await
            .unwrap();

        let summary = engine.subscriptions.reconcile_pending_credits().await.unwrap();
        assert_eq!(summary.still_pending, 1);
        assert_eq!(summary.reconciled, 0);

        let invoice = engine
            .store
            .find_invoice_covering(sub.id, utc(2024, 1, 15))
            .await
            .unwrap()
            .unwrap();
        assert!(invoice.credit_pending);
    }
}

#[cfg(test)]
mod dunning_tests {
    use crate::config::{AutomationGuardrails, DunningConfig};
    use crate::subscriptions::{Subscription, SubscriptionStatus};
    use crate::testutil::*;
    use chrono::{DateTime, Duration, Utc};
    use std::sync::atomic::Ordering;
    use uuid::Uuid;

    /// Signup on Jan 15, renewal fails on Feb 15 (the due date)
    async fn overdue_subscription(engine: &TestEngine) -> (Subscription, DateTime<Utc>) {
        let user = Uuid::new_v4();
        let sub = engine
            .subscriptions
            .handle_order_paid(paid_for_plan(user, utc(2024, 1, 15), "signup"))
            .await
            .unwrap();
        let failed_at = sub.next_renewal_at;
        let sub = engine
            .subscriptions
            .handle_order_failed(failed_for_sub(sub.id, user, failed_at, "renewal-1"))
            .await
            .unwrap();
        (sub, failed_at)
    }

    #[tokio::test]
    async fn test_immediate_tick_reaches_level_one() {
        let engine = TestEngine::new();
        let (sub, failed_at) = overdue_subscription(&engine).await;
        let config = DunningConfig::default();
        let guardrails = AutomationGuardrails::default();

        let summary = engine
            .dunning
            .run_tick(failed_at, &config, &guardrails, None)
            .await
            .unwrap();
        assert_eq!(summary.escalated, 1);

        let sub = engine.subscriptions.get(sub.id).await.unwrap();
        assert_eq!(sub.dunning_level, 1);
        assert_eq!(sub.status, SubscriptionStatus::Overdue);

        let levels: Vec<i16> = engine.notifier.dunning_sent().iter().map(|(_, l)| *l).collect();
        assert_eq!(levels, vec![1]);
    }

    #[tokio::test]
    async fn test_levels_follow_configured_delays() {
        let engine = TestEngine::new();
        let (sub, failed_at) = overdue_subscription(&engine).await;
        let config = DunningConfig::default();
        let guardrails = AutomationGuardrails::default();

        // Day 0 -> level 1
        engine
            .dunning
            .run_tick(failed_at, &config, &guardrails, None)
            .await
            .unwrap();

        // Day 2: level 2 needs 3 days, nothing happens
        engine
            .dunning
            .run_tick(failed_at + Duration::days(2), &config, &guardrails, None)
            .await
            .unwrap();
        assert_eq!(engine.subscriptions.get(sub.id).await.unwrap().dunning_level, 1);

        // Day 3 -> level 2
        engine
            .dunning
            .run_tick(failed_at + Duration::days(3), &config, &guardrails, None)
            .await
            .unwrap();
        assert_eq!(engine.subscriptions.get(sub.id).await.unwrap().dunning_level, 2);

        // Day 7 -> level 3
        engine
            .dunning
            .run_tick(failed_at + Duration::days(7), &config, &guardrails, None)
            .await
            .unwrap();
        assert_eq!(engine.subscriptions.get(sub.id).await.unwrap().dunning_level, 3);

        // Day 10 -> level 4 and cancellation
        let summary = engine
            .dunning
            .run_tick(failed_at + Duration::days(10), &config, &guardrails, None)
            .await
            .unwrap();
        assert_eq!(summary.cancelled, 1);

        let sub = engine.subscriptions.get(sub.id).await.unwrap();
        assert_eq!(sub.dunning_level, 4);
        assert_eq!(sub.status, SubscriptionStatus::Cancelled);

        // One e-mail per level, in order, none skipped
        let levels: Vec<i16> = engine.notifier.dunning_sent().iter().map(|(_, l)| *l).collect();
        assert_eq!(levels, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_late_tick_walks_through_missed_levels() {
        let engine = TestEngine::new();
        let (sub, failed_at) = overdue_subscription(&engine).await;
        let config = DunningConfig::default();
        let guardrails = AutomationGuardrails::default();

        // Ticks were down for 10 days; a single tick catches up level by
        // level, sending every e-mail on the way, and cancels
        let summary = engine
            .dunning
            .run_tick(failed_at + Duration::days(10), &config, &guardrails, None)
            .await
            .unwrap();
        assert_eq!(summary.cancelled, 1);

        let sub = engine.subscriptions.get(sub.id).await.unwrap();
        assert_eq!(sub.dunning_level, 4);
        assert_eq!(sub.status, SubscriptionStatus::Cancelled);

        let levels: Vec<i16> = engine.notifier.dunning_sent().iter().map(|(_, l)| *l).collect();
        assert_eq!(levels, vec![1, 2, 3, 4]);

        // Cancelled subscriptions leave the scan; no more e-mails
        let summary = engine
            .dunning
            .run_tick(failed_at + Duration::days(11), &config, &guardrails, None)
            .await
            .unwrap();
        assert_eq!(summary.scanned, 0);
        assert_eq!(engine.notifier.dunning_sent().len(), 4);
    }

    #[tokio::test]
    async fn test_overlapping_ticks_send_one_email_per_level() {
        let engine = TestEngine::new();
        let (sub, failed_at) = overdue_subscription(&engine).await;
        let config = DunningConfig::default();
        let guardrails = AutomationGuardrails::default();

        // Two ticks inside the same threshold window
        engine
            .dunning
            .run_tick(failed_at, &config, &guardrails, None)
            .await
            .unwrap();
        engine
            .dunning
            .run_tick(failed_at + Duration::hours(1), &config, &guardrails, None)
            .await
            .unwrap();

        assert_eq!(engine.notifier.dunning_sent().len(), 1);
        assert_eq!(engine.subscriptions.get(sub.id).await.unwrap().dunning_level, 1);
    }

    #[tokio::test]
    async fn test_payment_during_dunning_stops_escalation() {
        let engine = TestEngine::new();
        let (sub, failed_at) = overdue_subscription(&engine).await;
        let config = DunningConfig::default();
        let guardrails = AutomationGuardrails::default();

        engine
            .dunning
            .run_tick(failed_at, &config, &guardrails, None)
            .await
            .unwrap();
        engine
            .dunning
            .run_tick(failed_at + Duration::days(3), &config, &guardrails, None)
            .await
            .unwrap();
        assert_eq!(engine.subscriptions.get(sub.id).await.unwrap().dunning_level, 2);

        // Customer pays on day 5, between levels 2 and 3
        let user = engine.subscriptions.get(sub.id).await.unwrap().user_id;
        let sub_after = engine
            .subscriptions
            .handle_order_paid(paid_for_sub(
                sub.id,
                user,
                failed_at + Duration::days(5),
                "recovery",
            ))
            .await
            .unwrap();
        assert_eq!(sub_after.status, SubscriptionStatus::Active);
        assert_eq!(sub_after.dunning_level, 0);
        assert_eq!(sub_after.failed_payment_count, 0);

        // The level 3 and 4 ticks find nothing overdue
        for days in [7, 10] {
            let summary = engine
                .dunning
                .run_tick(failed_at + Duration::days(days), &config, &guardrails, None)
                .await
                .unwrap();
            assert_eq!(summary.scanned, 0);
        }
        assert_eq!(engine.notifier.dunning_sent().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_transition_loses_gracefully() {
        let engine = TestEngine::new();
        let (sub, failed_at) = overdue_subscription(&engine).await;

        // Simulates the customer paying between the scheduler's read and
        // its escalation write: the expected level no longer matches
        let advanced = engine
            .store
            .escalate_dunning(sub.id, sub.dunning_episode, 2, 3, false, failed_at)
            .await
            .unwrap();
        assert!(!advanced);
        assert_eq!(engine.subscriptions.get(sub.id).await.unwrap().dunning_level, 0);
    }

    #[tokio::test]
    async fn test_disabled_level_is_skipped() {
        let engine = TestEngine::new();
        let (sub, failed_at) = overdue_subscription(&engine).await;
        let mut config = DunningConfig::default();
        config.levels[1].enabled = false; // no second notice
        let guardrails = AutomationGuardrails::default();

        engine
            .dunning
            .run_tick(failed_at, &config, &guardrails, None)
            .await
            .unwrap();
        // Day 3 would be level 2; it is disabled and level 3 needs 7 days
        engine
            .dunning
            .run_tick(failed_at + Duration::days(3), &config, &guardrails, None)
            .await
            .unwrap();
        assert_eq!(engine.subscriptions.get(sub.id).await.unwrap().dunning_level, 1);

        engine
            .dunning
            .run_tick(failed_at + Duration::days(7), &config, &guardrails, None)
            .await
            .unwrap();
        let sub = engine.subscriptions.get(sub.id).await.unwrap();
        assert_eq!(sub.dunning_level, 3);

        let levels: Vec<i16> = engine.notifier.dunning_sent().iter().map(|(_, l)| *l).collect();
        assert_eq!(levels, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_automation_disabled_suppresses_without_advancing() {
        let engine = TestEngine::new();
        let (sub, failed_at) = overdue_subscription(&engine).await;
        let config = DunningConfig::default();
        let guardrails = AutomationGuardrails {
            automation_enabled: false,
            ..Default::default()
        };

        let summary = engine
            .dunning
            .run_tick(failed_at, &config, &guardrails, None)
            .await
            .unwrap();
        assert_eq!(summary.suppressed, 1);
        assert_eq!(engine.subscriptions.get(sub.id).await.unwrap().dunning_level, 0);
        assert!(engine.notifier.dunning_sent().is_empty());

        // Re-enabling picks the escalation back up
        let summary = engine
            .dunning
            .run_tick(
                failed_at + Duration::hours(1),
                &config,
                &AutomationGuardrails::default(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(summary.escalated, 1);
        assert_eq!(engine.subscriptions.get(sub.id).await.unwrap().dunning_level, 1);
    }

    #[tokio::test]
    async fn test_excluded_role_is_never_dunned() {
        let engine = TestEngine::new();
        let (sub, failed_at) = overdue_subscription(&engine).await;
        let user = engine.subscriptions.get(sub.id).await.unwrap().user_id;
        engine.store.set_user_role(user, "administrator");

        let config = DunningConfig::default();
        let guardrails = AutomationGuardrails {
            excluded_roles: vec!["administrator".to_string()],
            ..Default::default()
        };

        let summary = engine
            .dunning
            .run_tick(failed_at, &config, &guardrails, None)
            .await
            .unwrap();
        assert_eq!(summary.suppressed, 1);
        assert!(engine.notifier.dunning_sent().is_empty());
    }

    #[tokio::test]
    async fn test_minimum_amount_floor_suppresses() {
        let engine = TestEngine::new();
        let (sub, failed_at) = overdue_subscription(&engine).await;
        let config = DunningConfig::default();
        // Subscriptions charge 1000 cents; the floor is above that
        let guardrails = AutomationGuardrails {
            min_amount_cents: 2000,
            ..Default::default()
        };

        let summary = engine
            .dunning
            .run_tick(failed_at, &config, &guardrails, None)
            .await
            .unwrap();
        assert_eq!(summary.suppressed, 1);
        assert_eq!(engine.subscriptions.get(sub.id).await.unwrap().dunning_level, 0);
    }

    #[tokio::test]
    async fn test_daily_email_cap_suppresses_overflow() {
        let engine = TestEngine::new();

        // Two overdue subscriptions, distinct users
        let (first, failed_at) = overdue_subscription(&engine).await;
        let user_b = Uuid::new_v4();
        let sub_b = engine
            .subscriptions
            .handle_order_paid(paid_for_plan(user_b, utc(2024, 1, 16), "signup-b"))
            .await
            .unwrap();
        let sub_b = engine
            .subscriptions
            .handle_order_failed(failed_for_sub(
                sub_b.id,
                user_b,
                sub_b.next_renewal_at,
                "renewal-b",
            ))
            .await
            .unwrap();

        let config = DunningConfig::default();
        let capped = AutomationGuardrails {
            max_emails_per_day: 1,
            ..Default::default()
        };

        let now = failed_at + Duration::days(2);
        let summary = engine.dunning.run_tick(now, &config, &capped, None).await.unwrap();
        assert_eq!(summary.escalated, 1);
        assert_eq!(summary.suppressed, 1);
        assert_eq!(engine.notifier.dunning_sent().len(), 1);

        // The suppressed subscription kept its level and is picked up
        // once the cap stops binding
        assert_eq!(engine.subscriptions.get(sub_b.id).await.unwrap().dunning_level, 0);
        let uncapped = AutomationGuardrails::default();
        engine
            .dunning
            .run_tick(now + Duration::hours(1), &config, &uncapped, None)
            .await
            .unwrap();
        assert_eq!(engine.subscriptions.get(sub_b.id).await.unwrap().dunning_level, 1);
        let _ = first;
    }

    #[tokio::test]
    async fn test_send_failure_retries_next_tick() {
        let engine = TestEngine::new();
        let (sub, failed_at) = overdue_subscription(&engine).await;
        let config = DunningConfig::default();
        let guardrails = AutomationGuardrails::default();

        engine.notifier.fail_dunning.store(true, Ordering::SeqCst);
        let summary = engine
            .dunning
            .run_tick(failed_at, &config, &guardrails, None)
            .await
            .unwrap();
        assert_eq!(summary.send_failures, 1);

        // Nothing recorded, nothing advanced
        let sub_now = engine.subscriptions.get(sub.id).await.unwrap();
        assert_eq!(sub_now.dunning_level, 0);
        assert!(engine.store.list_dunning_emails(sub.id).await.unwrap().is_empty());

        // Delivery recovers; the same level goes out once
        engine.notifier.fail_dunning.store(false, Ordering::SeqCst);
        engine
            .dunning
            .run_tick(failed_at + Duration::hours(1), &config, &guardrails, None)
            .await
            .unwrap();
        assert_eq!(engine.subscriptions.get(sub.id).await.unwrap().dunning_level, 1);
        assert_eq!(engine.store.list_dunning_emails(sub.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_overdue_episode_sends_fresh_emails() {
        let engine = TestEngine::new();
        let (sub, failed_at) = overdue_subscription(&engine).await;
        let config = DunningConfig::default();
        let guardrails = AutomationGuardrails::default();
        let user = engine.subscriptions.get(sub.id).await.unwrap().user_id;

        // First episode reaches level 1, then the customer recovers
        engine
            .dunning
            .run_tick(failed_at, &config, &guardrails, None)
            .await
            .unwrap();
        engine
            .subscriptions
            .handle_order_paid(paid_for_sub(
                sub.id,
                user,
                failed_at + Duration::days(1),
                "recovery",
            ))
            .await
            .unwrap();

        // Next cycle fails again: a new episode, so level 1 mails again
        let sub_now = engine.subscriptions.get(sub.id).await.unwrap();
        let second_failure = sub_now.next_renewal_at;
        engine
            .subscriptions
            .handle_order_failed(failed_for_sub(sub.id, user, second_failure, "renewal-2"))
            .await
            .unwrap();
        engine
            .dunning
            .run_tick(second_failure, &config, &guardrails, None)
            .await
            .unwrap();

        let levels: Vec<i16> = engine.notifier.dunning_sent().iter().map(|(_, l)| *l).collect();
        assert_eq!(levels, vec![1, 1]);
        let emails = engine.store.list_dunning_emails(sub.id).await.unwrap();
        assert_eq!(emails.len(), 2);
        assert_ne!(emails[0].episode, emails[1].episode);
    }

    #[tokio::test]
    async fn test_soft_budget_stops_early_without_damage() {
        let engine = TestEngine::new();
        let (_, failed_at) = overdue_subscription(&engine).await;
        let config = DunningConfig::default();
        let guardrails = AutomationGuardrails::default();

        // Zero budget: the tick gives up before touching anything
        let summary = engine
            .dunning
            .run_tick(
                failed_at,
                &config,
                &guardrails,
                Some(std::time::Duration::ZERO),
            )
            .await
            .unwrap();
        assert!(summary.stopped_early);
        assert_eq!(summary.scanned, 0);
        assert!(engine.notifier.dunning_sent().is_empty());

        // The next tick does the work
        let summary = engine
            .dunning
            .run_tick(failed_at, &config, &guardrails, None)
            .await
            .unwrap();
        assert_eq!(summary.escalated, 1);
    }
}

#[cfg(test)]
mod reminder_tests {
    use crate::config::ReminderConfig;
    use crate::events::ManualActionKind;
    use crate::testutil::*;
    use crate::ManualAction;
    use chrono::Duration;
    use std::sync::atomic::Ordering;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_three_day_and_one_day_reminders_fire_once() {
        let engine = TestEngine::new();
        let user = Uuid::new_v4();
        let config = ReminderConfig::default();

        let sub = engine
            .subscriptions
            .handle_order_paid(paid_for_plan(user, utc(2024, 3, 1), "order-1"))
            .await
            .unwrap();
        let renewal = sub.next_renewal_at; // Apr 1

        // 3 days out
        let summary = engine
            .reminders
            .run_pass(renewal - Duration::days(3), &config)
            .await
            .unwrap();
        assert_eq!(summary.sent, 1);

        // Re-running inside the window sends nothing new
        let summary = engine
            .reminders
            .run_pass(renewal - Duration::days(3) + Duration::hours(6), &config)
            .await
            .unwrap();
        assert_eq!(summary.sent, 0);

        // 1 day out
        let summary = engine
            .reminders
            .run_pass(renewal - Duration::days(1), &config)
            .await
            .unwrap();
        assert_eq!(summary.sent, 1);

        let sent = engine.notifier.reminders_sent();
        let windows: Vec<u32> = sent.iter().map(|(_, d)| *d).collect();
        assert_eq!(windows, vec![3, 1]);
    }

    #[tokio::test]
    async fn test_reminder_flags_reset_on_renewal() {
        let engine = TestEngine::new();
        let user = Uuid::new_v4();
        let config = ReminderConfig::default();

        let sub = engine
            .subscriptions
            .handle_order_paid(paid_for_plan(user, utc(2024, 3, 1), "order-1"))
            .await
            .unwrap();
        let renewal = sub.next_renewal_at;

        engine
            .reminders
            .run_pass(renewal - Duration::days(3), &config)
            .await
            .unwrap();

        // Renewal payment clears the flags for the new cycle
        let sub = engine
            .subscriptions
            .handle_order_paid(paid_for_sub(sub.id, user, renewal, "order-2"))
            .await
            .unwrap();
        assert!(!sub.meta.reminders_sent.three_day);

        let summary = engine
            .reminders
            .run_pass(sub.next_renewal_at - Duration::days(3), &config)
            .await
            .unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(engine.notifier.reminders_sent().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_reminder_send_is_retried() {
        let engine = TestEngine::new();
        let user = Uuid::new_v4();
        let config = ReminderConfig::default();

        let sub = engine
            .subscriptions
            .handle_order_paid(paid_for_plan(user, utc(2024, 3, 1), "order-1"))
            .await
            .unwrap();
        let renewal = sub.next_renewal_at;

        engine.notifier.fail_reminders.store(true, Ordering::SeqCst);
        let summary = engine
            .reminders
            .run_pass(renewal - Duration::days(3), &config)
            .await
            .unwrap();
        assert_eq!(summary.send_failures, 1);

        engine.notifier.fail_reminders.store(false, Ordering::SeqCst);
        let summary = engine
            .reminders
            .run_pass(renewal - Duration::days(3) + Duration::hours(1), &config)
            .await
            .unwrap();
        assert_eq!(summary.sent, 1);
    }

    #[tokio::test]
    async fn test_only_active_subscriptions_get_reminders() {
        let engine = TestEngine::new();
        let user = Uuid::new_v4();
        let config = ReminderConfig::default();

        let sub = engine
            .subscriptions
            .handle_order_paid(paid_for_plan(user, utc(2024, 3, 1), "order-1"))
            .await
            .unwrap();
        engine
            .subscriptions
            .apply_manual_action(ManualAction {
                subscription_id: sub.id,
                action: ManualActionKind::Pause,
                actor_id: user,
            })
            .await
            .unwrap();

        let summary = engine
            .reminders
            .run_pass(sub.next_renewal_at - Duration::days(3), &config)
            .await
            .unwrap();
        assert_eq!(summary.scanned, 0);
        assert!(engine.notifier.reminders_sent().is_empty());
    }
}
