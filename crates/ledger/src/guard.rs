//! Idempotency guard over provider transaction ids

use std::sync::Arc;

use crate::error::{LedgerError, LedgerResult};
use crate::repository::TransactionRecordRepository;

/// Pre-check against the transaction record store.
///
/// The unique constraint on the record's transaction id is the final
/// safety net when two deliveries race past this check.
#[derive(Clone)]
pub struct IdempotencyGuard {
    transactions: Arc<dyn TransactionRecordRepository>,
}

impl IdempotencyGuard {
    pub fn new(transactions: Arc<dyn TransactionRecordRepository>) -> Self {
        Self { transactions }
    }

    pub async fn has_been_processed(&self, external_transaction_id: &str) -> LedgerResult<bool> {
        let id = external_transaction_id.trim();
        if id.is_empty() {
            return Err(LedgerError::InvalidInput(
                "Transaction id must not be empty".to_string(),
            ));
        }
        self.transactions.exists(id).await
    }
}
