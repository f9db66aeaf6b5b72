//! Wallet credit gateway
//!
//! The wallet (points balance) is owned by another part of the platform;
//! this module is the engine's adapter onto it. Every credit carries a
//! causally unique key - (subscription, invoice) - and the production
//! implementation turns that key into an append-only `usage_tracking` row
//! with a unique index, so replaying a credit is a no-op that returns the
//! original transaction.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Idempotency key for a wallet operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CreditKey {
    pub subscription_id: Uuid,
    pub invoice_id: Uuid,
}

/// Result of a wallet operation
#[derive(Debug, Clone)]
pub struct WalletTransaction {
    pub transaction_id: Uuid,
    /// False when the key had already been applied and nothing moved
    pub applied: bool,
}

/// Gateway to the wallet ledger
#[async_trait]
pub trait WalletGateway: Send + Sync {
    /// Credit points, at most once per key
    async fn credit(
        &self,
        user_id: Uuid,
        points: i64,
        key: CreditKey,
        meta: Value,
    ) -> BillingResult<WalletTransaction>;

    /// Revoke a previous credit (refund path), at most once per key
    async fn revoke(
        &self,
        user_id: Uuid,
        points: i64,
        key: CreditKey,
    ) -> BillingResult<WalletTransaction>;
}

/// Postgres-backed wallet ledger.
///
/// `usage_tracking` has a unique index per (subscription_id, invoice_id,
/// direction); the insert-or-fetch below is what makes credits
/// at-most-once under concurrent replays.
pub struct PgWalletLedger {
    pool: PgPool,
}

impl PgWalletLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn apply(
        &self,
        user_id: Uuid,
        points: i64,
        key: CreditKey,
        direction: &str,
        meta: Value,
    ) -> BillingResult<WalletTransaction> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO usage_tracking
                (id, subscription_id, invoice_id, user_id, points, direction, meta, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (subscription_id, invoice_id, direction) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key.subscription_id)
        .bind(key.invoice_id)
        .bind(user_id)
        .bind(points)
        .bind(direction)
        .bind(&meta)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::WalletCredit(e.to_string()))?;

        match inserted {
            Some((id,)) => {
                tracing::info!(
                    transaction_id = %id,
                    user_id = %user_id,
                    points = points,
                    direction = %direction,
                    "Wallet ledger entry recorded"
                );
                Ok(WalletTransaction {
                    transaction_id: id,
                    applied: true,
                })
            }
            None => {
                // Replay: hand back the transaction that already exists
                let (id,): (Uuid,) = sqlx::query_as(
                    r#"
                    SELECT id FROM usage_tracking
                    WHERE subscription_id = $1 AND invoice_id = $2 AND direction = $3
                    "#,
                )
                .bind(key.subscription_id)
                .bind(key.invoice_id)
                .bind(direction)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| BillingError::WalletCredit(e.to_string()))?;

                Ok(WalletTransaction {
                    transaction_id: id,
                    applied: false,
                })
            }
        }
    }
}

#[async_trait]
impl WalletGateway for PgWalletLedger {
    async fn credit(
        &self,
        user_id: Uuid,
        points: i64,
        key: CreditKey,
        meta: Value,
    ) -> BillingResult<WalletTransaction> {
        self.apply(user_id, points, key, "credit", meta).await
    }

    async fn revoke(
        &self,
        user_id: Uuid,
        points: i64,
        key: CreditKey,
    ) -> BillingResult<WalletTransaction> {
        self.apply(user_id, points, key, "revoke", Value::Null).await
    }
}
