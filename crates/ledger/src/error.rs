//! Ledger error types

use thiserror::Error;

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors raised by the fee ledger
///
/// Pending-review outcomes are not errors; they are carried by
/// [`crate::PendingReason`] on the transaction record. Everything here is
/// either a caller mistake or a storage failure the provider should retry.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid notification payload: {0}")]
    InvalidPayload(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Alert delivery failed: {0}")]
    Alert(String),
}

impl LedgerError {
    /// Whether the provider should redeliver the notification
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Database(_))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Database(err.to_string())
    }
}

