//! Outbound notifications
//!
//! Dunning e-mails and renewal reminders go through this seam. Delivery
//! problems are reported as `false` and never as errors: a failed send
//! must not block or roll back a state transition, it just means the
//! scheduler retries on its next tick.

use std::time::Duration;

use async_trait::async_trait;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

/// Notification sink for billing events
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Dunning e-mail for an unpaid invoice at the given level (1-4)
    async fn send_dunning_email(&self, invoice_id: Uuid, level: i16) -> bool;

    /// Upcoming-renewal reminder, `days_before` days out
    async fn send_renewal_reminder(&self, subscription_id: Uuid, days_before: u32) -> bool;

    /// Immediate payment-failed notice (fires from the state machine,
    /// before any dunning level advances)
    async fn send_payment_failed(&self, invoice_id: Uuid, subscription_id: Uuid, order_ref: &str)
        -> bool;
}

/// Resend-style HTTP e-mail notifier
#[derive(Clone)]
pub struct EmailNotifier {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    from_address: String,
}

impl EmailNotifier {
    pub fn new(api_key: String, endpoint: String, from_address: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            endpoint,
            from_address,
        }
    }

    /// Build from environment. A missing API key yields a notifier whose
    /// sends all fail (and log); the engine keeps running regardless.
    pub fn from_env() -> Self {
        let api_key = std::env::var("RESEND_API_KEY").unwrap_or_default();
        let endpoint = std::env::var("EMAIL_API_URL")
            .unwrap_or_else(|_| "https://api.resend.com/emails".to_string());
        let from_address = std::env::var("BILLING_EMAIL_FROM")
            .unwrap_or_else(|_| "billing@pointbill.app".to_string());

        if api_key.is_empty() {
            tracing::warn!("RESEND_API_KEY not set - billing e-mails will not be delivered");
        }

        Self::new(api_key, endpoint, from_address)
    }

    async fn post_email(&self, template: &str, payload: serde_json::Value) -> bool {
        if self.api_key.is_empty() {
            tracing::warn!(template = %template, "Skipping e-mail send, no API key configured");
            return false;
        }

        // Transient network hiccups get a couple of quick retries; real
        // failures surface as false and the caller's tick logic retries
        let strategy = ExponentialBackoff::from_millis(200)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(2);

        let result = Retry::spawn(strategy, || async {
            let response = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&payload)
                .send()
                .await
                .map_err(|e| e.to_string())?;

            if response.status().is_success() {
                Ok(())
            } else {
                Err(format!("status {}", response.status()))
            }
        })
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(template = %template, error = %e, "E-mail send failed");
                false
            }
        }
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn send_dunning_email(&self, invoice_id: Uuid, level: i16) -> bool {
        let template = match level {
            1 => "dunning_payment_failed",
            2 => "dunning_second_notice",
            3 => "dunning_final_warning",
            _ => "dunning_cancellation",
        };

        self.post_email(
            template,
            serde_json::json!({
                "from": self.from_address,
                "template": template,
                "invoice_id": invoice_id,
                "dunning_level": level,
            }),
        )
        .await
    }

    async fn send_renewal_reminder(&self, subscription_id: Uuid, days_before: u32) -> bool {
        self.post_email(
            "renewal_reminder",
            serde_json::json!({
                "from": self.from_address,
                "template": "renewal_reminder",
                "subscription_id": subscription_id,
                "days_before": days_before,
            }),
        )
        .await
    }

    async fn send_payment_failed(
        &self,
        invoice_id: Uuid,
        subscription_id: Uuid,
        order_ref: &str,
    ) -> bool {
        self.post_email(
            "payment_failed",
            serde_json::json!({
                "from": self.from_address,
                "template": "payment_failed",
                "invoice_id": invoice_id,
                "subscription_id": subscription_id,
                "order_ref": order_ref,
            }),
        )
        .await
    }
}
