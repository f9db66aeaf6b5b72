//! Billing error types

use thiserror::Error;

/// Errors produced by the billing engine
#[derive(Debug, Error)]
pub enum BillingError {
    /// Referenced subscription/invoice/plan does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// An invoice already covers an overlapping billing period
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A status transition the state machine does not permit
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Renewal interval is malformed (e.g. interval_count < 1)
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    /// Wallet gateway unreachable or rejected the credit
    #[error("Wallet credit failed: {0}")]
    WalletCredit(String),

    /// Notifier could not deliver a message
    #[error("Notification failed: {0}")]
    Notification(String),

    /// Missing or invalid dunning/automation configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Optimistic lock failed - row was modified by another process
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => BillingError::NotFound("row not found".to_string()),
            other => BillingError::Database(other.to_string()),
        }
    }
}

/// Result type for billing operations
pub type BillingResult<T> = Result<T, BillingError>;
