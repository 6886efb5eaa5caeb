//! Repository interfaces, one per aggregate
//!
//! The engines only ever talk to these traits. `store::postgres` implements
//! them over a `PgPool`; `store::memory` implements them in process for tests
//! and local runs.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::LedgerResult;
use crate::fee_line::{FeeLine, ScheduleChange};
use crate::models::{
    AppliedPayment, ClassFeeSchedule, FeeCategory, NewPayment, Payment, PaymentMethod,
    PendingReason, PhoneAlias, RecordInsert, TransactionRecord,
};
use crate::store::memory::MemoryStore;
use crate::store::postgres::PgLedgerStore;

/// Read-only learner/guardian directory
#[async_trait]
pub trait LearnerDirectory: Send + Sync {
    /// Learners linked to every guardian whose phone is `phone` (normalized)
    async fn learners_by_guardian_phone(&self, phone: &str) -> LedgerResult<Vec<Uuid>>;

    /// Learners whose own recorded phone is `phone` (normalized)
    async fn learners_by_own_phone(&self, phone: &str) -> LedgerResult<Vec<Uuid>>;

    /// Learners currently enrolled in a class for a year
    async fn enrolled_learners(&self, class_id: Uuid, academic_year: i32) -> LedgerResult<Vec<Uuid>>;
}

#[async_trait]
pub trait AliasRepository: Send + Sync {
    async fn learners_for_phone(&self, phone: &str) -> LedgerResult<Vec<Uuid>>;

    /// Create the alias, or bump `last_confirmed_at` if it already exists
    async fn remember(&self, learner_id: Uuid, phone: &str) -> LedgerResult<PhoneAlias>;
}

#[async_trait]
pub trait FeeCategoryRepository: Send + Sync {
    /// Case-insensitive lookup by category code
    async fn find_by_code(&self, code: &str) -> LedgerResult<Option<FeeCategory>>;

    async fn list(&self) -> LedgerResult<Vec<FeeCategory>>;
}

#[async_trait]
pub trait FeeScheduleRepository: Send + Sync {
    async fn for_class(&self, class_id: Uuid, academic_year: i32) -> LedgerResult<Vec<ClassFeeSchedule>>;

    /// Classes that have at least one schedule row for the year
    async fn scheduled_classes(&self, academic_year: i32) -> LedgerResult<Vec<Uuid>>;
}

#[async_trait]
pub trait FeeLineRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> LedgerResult<Option<FeeLine>>;

    async fn list_for_learner(&self, learner_id: Uuid) -> LedgerResult<Vec<FeeLine>>;

    /// Lines with `amount_due > amount_paid`, any order
    async fn outstanding_for_learner(&self, learner_id: Uuid) -> LedgerResult<Vec<FeeLine>>;

    /// Insert the payment and credit the fee line as one atomic unit,
    /// holding a row lock on the line.
    ///
    /// Automated payments are idempotent on `reference`: when one already
    /// exists the earlier payment and the line's current state come back
    /// with `already_applied = true` and nothing is written.
    async fn apply_payment(&self, payment: NewPayment) -> LedgerResult<AppliedPayment>;

    /// Create or adjust the learner's line for a schedule row under a row
    /// lock, following [`FeeLine::apply_schedule`].
    async fn sync_from_schedule(
        &self,
        learner_id: Uuid,
        schedule: &ClassFeeSchedule,
    ) -> LedgerResult<(FeeLine, ScheduleChange)>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn find_by_reference(&self, method: PaymentMethod, reference: &str) -> LedgerResult<Option<Payment>>;

    async fn list_for_fee_line(&self, fee_line_id: Uuid) -> LedgerResult<Vec<Payment>>;
}

#[async_trait]
pub trait TransactionRecordRepository: Send + Sync {
    async fn exists(&self, trans_id: &str) -> LedgerResult<bool>;

    /// Insert, reporting a unique-key clash as [`RecordInsert::Duplicate`]
    async fn insert(&self, record: &TransactionRecord) -> LedgerResult<RecordInsert>;

    async fn find(&self, trans_id: &str) -> LedgerResult<Option<TransactionRecord>>;

    /// Turn a PENDING record without a payment into `success`, keeping its id
    /// and timestamp. `None` when there is no such record to settle.
    async fn settle_pending(&self, success: &TransactionRecord) -> LedgerResult<Option<TransactionRecord>>;

    /// Pending records, newest first
    async fn list_pending(
        &self,
        reason: Option<PendingReason>,
        limit: i64,
        offset: i64,
    ) -> LedgerResult<Vec<TransactionRecord>>;
}

/// Store-access handle handed to the orchestrator and propagator
#[derive(Clone)]
pub struct Stores {
    pub directory: Arc<dyn LearnerDirectory>,
    pub aliases: Arc<dyn AliasRepository>,
    pub categories: Arc<dyn FeeCategoryRepository>,
    pub schedules: Arc<dyn FeeScheduleRepository>,
    pub fee_lines: Arc<dyn FeeLineRepository>,
    pub payments: Arc<dyn PaymentRepository>,
    pub transactions: Arc<dyn TransactionRecordRepository>,
}

impl Stores {
    /// Every repository backed by the same Postgres pool
    pub fn postgres(pool: PgPool, phone_country_code: &str) -> Self {
        let store = Arc::new(PgLedgerStore::new(pool, phone_country_code));
        Self {
            directory: store.clone(),
            aliases: store.clone(),
            categories: store.clone(),
            schedules: store.clone(),
            fee_lines: store.clone(),
            payments: store.clone(),
            transactions: store,
        }
    }

    /// Every repository backed by one in-memory store
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            directory: store.clone(),
            aliases: store.clone(),
            categories: store.clone(),
            schedules: store.clone(),
            fee_lines: store.clone(),
            payments: store.clone(),
            transactions: store,
        }
    }
}
