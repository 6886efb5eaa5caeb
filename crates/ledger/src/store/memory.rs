//! In-memory implementation of the ledger repositories
//!
//! Every operation takes one lock over the whole state, which gives the same
//! atomicity the Postgres store gets from transactions and row locks. Used by
//! tests and for running the API without a database.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::fee_line::{FeeLine, ScheduleChange, Term};
use crate::models::{
    AppliedPayment, ClassFeeSchedule, FeeCategory, FeeFrequency, NewPayment, Payment,
    PaymentMethod, PendingReason, PhoneAlias, RecordInsert, TransactionRecord, TransactionStatus,
};
use crate::phone;
use crate::repository::{
    AliasRepository, FeeCategoryRepository, FeeLineRepository, FeeScheduleRepository,
    LearnerDirectory, PaymentRepository, TransactionRecordRepository,
};

#[derive(Debug, Clone)]
struct Learner {
    phone: Option<String>,
}

#[derive(Debug, Clone)]
struct Guardian {
    phone: Option<String>,
    learners: Vec<Uuid>,
}

#[derive(Debug, Clone)]
struct Enrollment {
    learner_id: Uuid,
    class_id: Uuid,
    academic_year: i32,
    active: bool,
}

#[derive(Default)]
struct MemoryState {
    learners: HashMap<Uuid, Learner>,
    guardians: HashMap<Uuid, Guardian>,
    enrollments: Vec<Enrollment>,
    categories: Vec<FeeCategory>,
    schedules: Vec<ClassFeeSchedule>,
    fee_lines: HashMap<Uuid, FeeLine>,
    payments: Vec<Payment>,
    transactions: Vec<TransactionRecord>,
    aliases: Vec<PhoneAlias>,
    fail_next_payment: bool,
    failing_learners: HashSet<Uuid>,
    failing_classes: HashSet<Uuid>,
}

/// In-process ledger store
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    country_code: String,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(phone::DEFAULT_COUNTRY_CODE)
    }
}

impl MemoryStore {
    pub fn new(phone_country_code: &str) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            country_code: phone_country_code.to_string(),
        }
    }

    fn matches_phone(&self, stored: Option<&str>, normalized: &str) -> bool {
        stored.is_some_and(|p| phone::matches(p, normalized, &self.country_code))
    }

    // ---- directory setup ----

    pub async fn add_learner(&self, phone: Option<&str>) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().await.learners.insert(
            id,
            Learner {
                phone: phone.map(str::to_string),
            },
        );
        id
    }

    pub async fn add_guardian(&self, phone: &str, learners: &[Uuid]) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().await.guardians.insert(
            id,
            Guardian {
                phone: Some(phone.to_string()),
                learners: learners.to_vec(),
            },
        );
        id
    }

    pub async fn enroll(&self, learner_id: Uuid, class_id: Uuid, academic_year: i32) {
        let mut state = self.state.lock().await;
        for e in state
            .enrollments
            .iter_mut()
            .filter(|e| e.learner_id == learner_id && e.academic_year == academic_year)
        {
            e.active = false;
        }
        state.enrollments.push(Enrollment {
            learner_id,
            class_id,
            academic_year,
            active: true,
        });
    }

    // ---- fee configuration setup ----

    pub async fn add_category(&self, code: &str, frequency: FeeFrequency) -> FeeCategory {
        let category = FeeCategory {
            id: Uuid::new_v4(),
            code: code.to_string(),
            name: code.to_string(),
            frequency,
            recurring: !matches!(frequency, FeeFrequency::OneTime),
        };
        self.state.lock().await.categories.push(category.clone());
        category
    }

    /// Insert or replace the schedule row for (class, category, term, year)
    pub async fn set_schedule(
        &self,
        class_id: Uuid,
        category_id: Uuid,
        term: Option<Term>,
        academic_year: i32,
        amount_minor: i64,
    ) -> ClassFeeSchedule {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();
        let key = Term::or_default(term);

        if let Some(existing) = state.schedules.iter_mut().find(|s| {
            s.class_id == class_id
                && s.category_id == category_id
                && Term::or_default(s.term) == key
                && s.academic_year == academic_year
        }) {
            existing.amount_minor = amount_minor;
            existing.updated_at = now;
            return existing.clone();
        }

        let schedule = ClassFeeSchedule {
            id: Uuid::new_v4(),
            class_id,
            category_id,
            term,
            academic_year,
            amount_minor,
            updated_at: now,
        };
        state.schedules.push(schedule.clone());
        schedule
    }

    /// Insert a fee line directly, bypassing the propagator
    pub async fn insert_fee_line(&self, line: FeeLine) {
        self.state.lock().await.fee_lines.insert(line.id, line);
    }

    /// Convenience: a fresh unpaid line for a learner
    pub async fn add_fee_line(
        &self,
        learner_id: Uuid,
        category_id: Uuid,
        term: Option<Term>,
        academic_year: i32,
        amount_minor: i64,
    ) -> FeeLine {
        let now = OffsetDateTime::now_utc();
        let schedule = ClassFeeSchedule {
            id: Uuid::new_v4(),
            class_id: Uuid::nil(),
            category_id,
            term,
            academic_year,
            amount_minor,
            updated_at: now,
        };
        let mut line = FeeLine::from_schedule(learner_id, &schedule, now);
        line.schedule_id = None;
        self.insert_fee_line(line.clone()).await;
        line
    }

    // ---- fault injection ----

    /// Make the next `apply_payment` fail before writing anything
    pub async fn fail_next_payment(&self) {
        self.state.lock().await.fail_next_payment = true;
    }

    /// Make every fee line write for this learner fail
    pub async fn fail_writes_for(&self, learner_id: Uuid) {
        self.state.lock().await.failing_learners.insert(learner_id);
    }

    /// Make enrollment reads for this class fail
    pub async fn fail_reads_for_class(&self, class_id: Uuid) {
        self.state.lock().await.failing_classes.insert(class_id);
    }

    // ---- inspection ----

    pub async fn payment_count(&self) -> usize {
        self.state.lock().await.payments.len()
    }

    pub async fn transaction_count(&self) -> usize {
        self.state.lock().await.transactions.len()
    }

    pub async fn aliases(&self) -> Vec<PhoneAlias> {
        self.state.lock().await.aliases.clone()
    }
}

#[async_trait]
impl LearnerDirectory for MemoryStore {
    async fn learners_by_guardian_phone(&self, phone: &str) -> LedgerResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        let mut learners: Vec<Uuid> = Vec::new();
        for guardian in state
            .guardians
            .values()
            .filter(|g| self.matches_phone(g.phone.as_deref(), phone))
        {
            for id in &guardian.learners {
                if !learners.contains(id) {
                    learners.push(*id);
                }
            }
        }
        Ok(learners)
    }

    async fn learners_by_own_phone(&self, phone: &str) -> LedgerResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        Ok(state
            .learners
            .iter()
            .filter(|(_, l)| self.matches_phone(l.phone.as_deref(), phone))
            .map(|(id, _)| *id)
            .collect())
    }

    async fn enrolled_learners(&self, class_id: Uuid, academic_year: i32) -> LedgerResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        if state.failing_classes.contains(&class_id) {
            return Err(LedgerError::Database(format!(
                "injected read failure for class {}",
                class_id
            )));
        }
        Ok(state
            .enrollments
            .iter()
            .filter(|e| e.active && e.class_id == class_id && e.academic_year == academic_year)
            .map(|e| e.learner_id)
            .collect())
    }
}

#[async_trait]
impl AliasRepository for MemoryStore {
    async fn learners_for_phone(&self, phone: &str) -> LedgerResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        let mut learners: Vec<Uuid> = Vec::new();
        for alias in state.aliases.iter().filter(|a| a.phone == phone) {
            if !learners.contains(&alias.learner_id) {
                learners.push(alias.learner_id);
            }
        }
        Ok(learners)
    }

    async fn remember(&self, learner_id: Uuid, phone: &str) -> LedgerResult<PhoneAlias> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();

        if let Some(alias) = state
            .aliases
            .iter_mut()
            .find(|a| a.learner_id == learner_id && a.phone == phone)
        {
            alias.last_confirmed_at = now;
            return Ok(alias.clone());
        }

        let alias = PhoneAlias {
            id: Uuid::new_v4(),
            learner_id,
            phone: phone.to_string(),
            created_at: now,
            last_confirmed_at: now,
        };
        state.aliases.push(alias.clone());
        Ok(alias)
    }
}

#[async_trait]
impl FeeCategoryRepository for MemoryStore {
    async fn find_by_code(&self, code: &str) -> LedgerResult<Option<FeeCategory>> {
        let code = code.trim();
        Ok(self
            .state
            .lock()
            .await
            .categories
            .iter()
            .find(|c| c.code.eq_ignore_ascii_case(code))
            .cloned())
    }

    async fn list(&self) -> LedgerResult<Vec<FeeCategory>> {
        Ok(self.state.lock().await.categories.clone())
    }
}

#[async_trait]
impl FeeScheduleRepository for MemoryStore {
    async fn for_class(&self, class_id: Uuid, academic_year: i32) -> LedgerResult<Vec<ClassFeeSchedule>> {
        Ok(self
            .state
            .lock()
            .await
            .schedules
            .iter()
            .filter(|s| s.class_id == class_id && s.academic_year == academic_year)
            .cloned()
            .collect())
    }

    async fn scheduled_classes(&self, academic_year: i32) -> LedgerResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        let mut classes: Vec<Uuid> = Vec::new();
        for s in state.schedules.iter().filter(|s| s.academic_year == academic_year) {
            if !classes.contains(&s.class_id) {
                classes.push(s.class_id);
            }
        }
        Ok(classes)
    }
}

#[async_trait]
impl FeeLineRepository for MemoryStore {
    async fn get(&self, id: Uuid) -> LedgerResult<Option<FeeLine>> {
        Ok(self.state.lock().await.fee_lines.get(&id).cloned())
    }

    async fn list_for_learner(&self, learner_id: Uuid) -> LedgerResult<Vec<FeeLine>> {
        let state = self.state.lock().await;
        let mut lines: Vec<FeeLine> = state
            .fee_lines
            .values()
            .filter(|l| l.learner_id == learner_id)
            .cloned()
            .collect();
        lines.sort_by_key(FeeLine::allocation_key);
        Ok(lines)
    }

    async fn outstanding_for_learner(&self, learner_id: Uuid) -> LedgerResult<Vec<FeeLine>> {
        let state = self.state.lock().await;
        Ok(state
            .fee_lines
            .values()
            .filter(|l| l.learner_id == learner_id && l.is_outstanding())
            .cloned()
            .collect())
    }

    async fn apply_payment(&self, payment: NewPayment) -> LedgerResult<AppliedPayment> {
        let mut state = self.state.lock().await;

        if state.fail_next_payment {
            state.fail_next_payment = false;
            return Err(LedgerError::Database("injected payment failure".to_string()));
        }

        if payment.method.is_automated() {
            if let Some(existing) = state
                .payments
                .iter()
                .find(|p| p.method == payment.method && p.reference == payment.reference)
                .cloned()
            {
                let fee_line = state.fee_lines.get(&existing.fee_line_id).cloned().ok_or_else(|| {
                    LedgerError::NotFound(format!("Fee line {}", existing.fee_line_id))
                })?;
                return Ok(AppliedPayment {
                    payment: existing,
                    fee_line,
                    already_applied: true,
                });
            }
        }

        let now = OffsetDateTime::now_utc();
        let line = state
            .fee_lines
            .get_mut(&payment.fee_line_id)
            .ok_or_else(|| LedgerError::NotFound(format!("Fee line {}", payment.fee_line_id)))?;
        line.credit(payment.amount_minor, now);
        let fee_line = line.clone();

        let recorded = Payment {
            id: Uuid::new_v4(),
            fee_line_id: payment.fee_line_id,
            amount_minor: payment.amount_minor,
            method: payment.method,
            reference: payment.reference,
            created_at: now,
        };
        state.payments.push(recorded.clone());

        Ok(AppliedPayment {
            payment: recorded,
            fee_line,
            already_applied: false,
        })
    }

    async fn sync_from_schedule(
        &self,
        learner_id: Uuid,
        schedule: &ClassFeeSchedule,
    ) -> LedgerResult<(FeeLine, ScheduleChange)> {
        let mut state = self.state.lock().await;

        if state.failing_learners.contains(&learner_id) {
            return Err(LedgerError::Database(format!(
                "injected write failure for learner {}",
                learner_id
            )));
        }

        let now = OffsetDateTime::now_utc();
        let key = Term::or_default(schedule.term);

        let existing = state.fee_lines.values_mut().find(|l| {
            l.learner_id == learner_id
                && l.category_id == schedule.category_id
                && l.key_term() == key
                && l.academic_year == schedule.academic_year
        });

        match existing {
            Some(line) => {
                let change = line.apply_schedule(schedule, now);
                Ok((line.clone(), change))
            }
            None => {
                let line = FeeLine::from_schedule(learner_id, schedule, now);
                state.fee_lines.insert(line.id, line.clone());
                Ok((line, ScheduleChange::Created))
            }
        }
    }
}

#[async_trait]
impl PaymentRepository for MemoryStore {
    async fn find_by_reference(&self, method: PaymentMethod, reference: &str) -> LedgerResult<Option<Payment>> {
        Ok(self
            .state
            .lock()
            .await
            .payments
            .iter()
            .find(|p| p.method == method && p.reference == reference)
            .cloned())
    }

    async fn list_for_fee_line(&self, fee_line_id: Uuid) -> LedgerResult<Vec<Payment>> {
        Ok(self
            .state
            .lock()
            .await
            .payments
            .iter()
            .filter(|p| p.fee_line_id == fee_line_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TransactionRecordRepository for MemoryStore {
    async fn exists(&self, trans_id: &str) -> LedgerResult<bool> {
        Ok(self
            .state
            .lock()
            .await
            .transactions
            .iter()
            .any(|t| t.trans_id == trans_id))
    }

    async fn insert(&self, record: &TransactionRecord) -> LedgerResult<RecordInsert> {
        let mut state = self.state.lock().await;
        if state.transactions.iter().any(|t| t.trans_id == record.trans_id) {
            return Ok(RecordInsert::Duplicate);
        }
        state.transactions.push(record.clone());
        Ok(RecordInsert::Inserted(record.clone()))
    }

    async fn find(&self, trans_id: &str) -> LedgerResult<Option<TransactionRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .transactions
            .iter()
            .find(|t| t.trans_id == trans_id)
            .cloned())
    }

    async fn settle_pending(&self, success: &TransactionRecord) -> LedgerResult<Option<TransactionRecord>> {
        let mut state = self.state.lock().await;
        let Some(record) = state.transactions.iter_mut().find(|t| {
            t.trans_id == success.trans_id
                && t.status == TransactionStatus::Pending
                && t.payment_id.is_none()
        }) else {
            return Ok(None);
        };

        record.status = TransactionStatus::Success;
        record.pending_reason = None;
        record.learner_id = success.learner_id;
        record.fee_line_id = success.fee_line_id;
        record.payment_id = success.payment_id;
        if record.normalized_phone.is_none() {
            record.normalized_phone = success.normalized_phone.clone();
        }
        Ok(Some(record.clone()))
    }

    async fn list_pending(
        &self,
        reason: Option<PendingReason>,
        limit: i64,
        offset: i64,
    ) -> LedgerResult<Vec<TransactionRecord>> {
        let state = self.state.lock().await;
        let limit = usize::try_from(limit.max(0)).unwrap_or(0);
        let offset = usize::try_from(offset.max(0)).unwrap_or(0);

        // Newest first: later inserts sit at the end of the vec
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|t| t.status == TransactionStatus::Pending)
            .filter(|t| reason.map(|r| t.pending_reason == Some(r)).unwrap_or(true))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}
