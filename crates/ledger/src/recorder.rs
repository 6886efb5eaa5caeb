//! Transaction recorder: one audit row per inbound notification

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::LedgerResult;
use crate::models::{
    AppliedPayment, PendingReason, RecordInsert, TransactionRecord, TransactionStatus,
};
use crate::notification::PaymentNotification;
use crate::repository::TransactionRecordRepository;

/// Default and ceiling for review-queue page sizes
pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 200;

#[derive(Clone)]
pub struct TransactionRecorder {
    transactions: Arc<dyn TransactionRecordRepository>,
}

impl TransactionRecorder {
    pub fn new(transactions: Arc<dyn TransactionRecordRepository>) -> Self {
        Self { transactions }
    }

    /// Record a notification that settled a fee line
    pub async fn record_success(
        &self,
        notification: &PaymentNotification,
        normalized_phone: Option<&str>,
        learner_id: Uuid,
        applied: &AppliedPayment,
    ) -> LedgerResult<RecordInsert> {
        let record = TransactionRecord {
            learner_id: Some(learner_id),
            fee_line_id: Some(applied.fee_line.id),
            payment_id: Some(applied.payment.id),
            status: TransactionStatus::Success,
            pending_reason: None,
            ..base_record(notification, normalized_phone)
        };
        match self.transactions.insert(&record).await? {
            RecordInsert::Inserted(record) => Ok(RecordInsert::Inserted(record)),
            // A racing delivery may have held the same money for review
            RecordInsert::Duplicate => match self.transactions.settle_pending(&record).await? {
                Some(settled) => {
                    tracing::warn!(
                        trans_id = %settled.trans_id,
                        payment_id = ?settled.payment_id,
                        "Pending record settled by the delivery that applied the payment"
                    );
                    Ok(RecordInsert::Inserted(settled))
                }
                None => Ok(RecordInsert::Duplicate),
            },
        }
    }

    /// Record a notification held for staff review
    pub async fn record_pending(
        &self,
        notification: &PaymentNotification,
        normalized_phone: Option<&str>,
        learner_id: Option<Uuid>,
        reason: PendingReason,
    ) -> LedgerResult<RecordInsert> {
        let record = TransactionRecord {
            learner_id,
            fee_line_id: None,
            payment_id: None,
            status: TransactionStatus::Pending,
            pending_reason: Some(reason),
            ..base_record(notification, normalized_phone)
        };
        self.transactions.insert(&record).await
    }

    pub async fn find(&self, trans_id: &str) -> LedgerResult<Option<TransactionRecord>> {
        self.transactions.find(trans_id.trim()).await
    }

    /// Review queue, newest first. Page size is clamped to [1, MAX_PAGE_SIZE].
    pub async fn list_pending(
        &self,
        reason: Option<PendingReason>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> LedgerResult<Vec<TransactionRecord>> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = offset.unwrap_or(0).max(0);
        self.transactions.list_pending(reason, limit, offset).await
    }
}

fn base_record(notification: &PaymentNotification, normalized_phone: Option<&str>) -> TransactionRecord {
    TransactionRecord {
        id: Uuid::new_v4(),
        trans_id: notification.transaction_id.clone(),
        amount_minor: notification.amount_minor,
        phone: notification.phone.clone(),
        normalized_phone: normalized_phone.map(str::to_string),
        channel_id: notification.channel_id.clone(),
        bill_reference: notification.bill_reference.clone(),
        payer_name: notification.payer_name.clone(),
        learner_id: None,
        fee_line_id: None,
        payment_id: None,
        status: TransactionStatus::Pending,
        pending_reason: None,
        raw_payload: notification.raw_payload.clone(),
        created_at: OffsetDateTime::now_utc(),
    }
}
