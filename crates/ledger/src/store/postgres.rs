//! Postgres implementation of the ledger repositories

use async_trait::async_trait;
use sqlx::{FromRow, PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::fee_line::{FeeLine, FeeStatus, ScheduleChange, Term};
use crate::models::{
    AppliedPayment, ClassFeeSchedule, FeeCategory, FeeFrequency, NewPayment, Payment,
    PaymentMethod, PendingReason, PhoneAlias, RecordInsert, TransactionRecord, TransactionStatus,
};
use crate::phone;
use crate::repository::{
    AliasRepository, FeeCategoryRepository, FeeLineRepository, FeeScheduleRepository,
    LearnerDirectory, PaymentRepository, TransactionRecordRepository,
};

const FEE_LINE_COLUMNS: &str = "id, learner_id, category_id, term, academic_year, \
     base_amount_minor, amount_due_minor, amount_paid_minor, locked, status, \
     schedule_id, discount_reason, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, fee_line_id, amount_minor, method, reference, created_at";

const TRANSACTION_COLUMNS: &str = "id, trans_id, amount_minor, phone, normalized_phone, \
     channel_id, bill_reference, payer_name, learner_id, fee_line_id, payment_id, status, \
     pending_reason, raw_payload, created_at";

fn corrupt(what: &str, value: &str) -> LedgerError {
    LedgerError::Database(format!("Unexpected {} value '{}' in database", what, value))
}

fn parse_term(term: Option<String>) -> LedgerResult<Option<Term>> {
    term.map(|t| Term::parse(&t).ok_or_else(|| corrupt("term", &t)))
        .transpose()
}

/// Row type for student_fees
#[derive(Debug, FromRow)]
struct FeeLineRow {
    id: Uuid,
    learner_id: Uuid,
    category_id: Uuid,
    term: Option<String>,
    academic_year: i32,
    base_amount_minor: i64,
    amount_due_minor: i64,
    amount_paid_minor: i64,
    locked: bool,
    status: String,
    schedule_id: Option<Uuid>,
    discount_reason: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<FeeLineRow> for FeeLine {
    type Error = LedgerError;

    fn try_from(row: FeeLineRow) -> LedgerResult<Self> {
        let status = FeeStatus::parse(&row.status).ok_or_else(|| corrupt("status", &row.status))?;
        Ok(FeeLine {
            id: row.id,
            learner_id: row.learner_id,
            category_id: row.category_id,
            term: parse_term(row.term)?,
            academic_year: row.academic_year,
            base_amount_minor: row.base_amount_minor,
            amount_due_minor: row.amount_due_minor,
            amount_paid_minor: row.amount_paid_minor,
            locked: row.locked,
            status,
            schedule_id: row.schedule_id,
            discount_reason: row.discount_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Row type for payments
#[derive(Debug, FromRow)]
struct PaymentRow {
    id: Uuid,
    fee_line_id: Uuid,
    amount_minor: i64,
    method: String,
    reference: String,
    created_at: OffsetDateTime,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = LedgerError;

    fn try_from(row: PaymentRow) -> LedgerResult<Self> {
        let method = PaymentMethod::parse(&row.method).ok_or_else(|| corrupt("method", &row.method))?;
        Ok(Payment {
            id: row.id,
            fee_line_id: row.fee_line_id,
            amount_minor: row.amount_minor,
            method,
            reference: row.reference,
            created_at: row.created_at,
        })
    }
}

/// Row type for mpesa_transactions
#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    trans_id: String,
    amount_minor: i64,
    phone: String,
    normalized_phone: Option<String>,
    channel_id: String,
    bill_reference: String,
    payer_name: Option<String>,
    learner_id: Option<Uuid>,
    fee_line_id: Option<Uuid>,
    payment_id: Option<Uuid>,
    status: String,
    pending_reason: Option<String>,
    raw_payload: Option<serde_json::Value>,
    created_at: OffsetDateTime,
}

impl TryFrom<TransactionRow> for TransactionRecord {
    type Error = LedgerError;

    fn try_from(row: TransactionRow) -> LedgerResult<Self> {
        let status =
            TransactionStatus::parse(&row.status).ok_or_else(|| corrupt("status", &row.status))?;
        let pending_reason = row
            .pending_reason
            .map(|r| PendingReason::parse(&r).ok_or_else(|| corrupt("pending_reason", &r)))
            .transpose()?;
        Ok(TransactionRecord {
            id: row.id,
            trans_id: row.trans_id,
            amount_minor: row.amount_minor,
            phone: row.phone,
            normalized_phone: row.normalized_phone,
            channel_id: row.channel_id,
            bill_reference: row.bill_reference,
            payer_name: row.payer_name,
            learner_id: row.learner_id,
            fee_line_id: row.fee_line_id,
            payment_id: row.payment_id,
            status,
            pending_reason,
            raw_payload: row.raw_payload,
            created_at: row.created_at,
        })
    }
}

/// Row type for class_fee_structures
#[derive(Debug, FromRow)]
struct ScheduleRow {
    id: Uuid,
    class_id: Uuid,
    category_id: Uuid,
    term: Option<String>,
    academic_year: i32,
    amount_minor: i64,
    updated_at: OffsetDateTime,
}

/// Row type for fee_categories
#[derive(Debug, FromRow)]
struct CategoryRow {
    id: Uuid,
    code: String,
    name: String,
    frequency: String,
    recurring: bool,
}

impl TryFrom<CategoryRow> for FeeCategory {
    type Error = LedgerError;

    fn try_from(row: CategoryRow) -> LedgerResult<Self> {
        let frequency =
            FeeFrequency::parse(&row.frequency).ok_or_else(|| corrupt("frequency", &row.frequency))?;
        Ok(FeeCategory {
            id: row.id,
            code: row.code,
            name: row.name,
            frequency,
            recurring: row.recurring,
        })
    }
}

/// Keep the candidate rows whose stored phone normalizes to `normalized`
fn matching_phone(rows: Vec<(Uuid, String)>, normalized: &str, country_code: &str) -> Vec<Uuid> {
    let mut ids: Vec<Uuid> = Vec::new();
    for (id, stored) in rows {
        if phone::matches(&stored, normalized, country_code) && !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

fn collect<R, T>(rows: Vec<R>) -> LedgerResult<Vec<T>>
where
    T: TryFrom<R, Error = LedgerError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// All ledger repositories over one Postgres pool
pub struct PgLedgerStore {
    pool: PgPool,
    country_code: String,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool, phone_country_code: &str) -> Self {
        Self {
            pool,
            country_code: phone_country_code.to_string(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }


    async fn fetch_line(conn: &mut PgConnection, id: Uuid, for_update: bool) -> LedgerResult<Option<FeeLine>> {
        let sql = if for_update {
            format!("SELECT {FEE_LINE_COLUMNS} FROM student_fees WHERE id = $1 FOR UPDATE")
        } else {
            format!("SELECT {FEE_LINE_COLUMNS} FROM student_fees WHERE id = $1")
        };
        let row: Option<FeeLineRow> = sqlx::query_as(&sql).bind(id).fetch_optional(conn).await?;
        row.map(FeeLine::try_from).transpose()
    }

    async fn lock_line_by_key(
        conn: &mut PgConnection,
        learner_id: Uuid,
        schedule: &ClassFeeSchedule,
    ) -> LedgerResult<Option<FeeLine>> {
        let row: Option<FeeLineRow> = sqlx::query_as(&format!(
            "SELECT {FEE_LINE_COLUMNS} FROM student_fees \
             WHERE learner_id = $1 AND category_id = $2 \
               AND COALESCE(term, 'TERM1') = $3 AND academic_year = $4 \
             FOR UPDATE"
        ))
        .bind(learner_id)
        .bind(schedule.category_id)
        .bind(Term::or_default(schedule.term).as_str())
        .bind(schedule.academic_year)
        .fetch_optional(conn)
        .await?;
        row.map(FeeLine::try_from).transpose()
    }

    async fn find_automated_payment(
        conn: &mut PgConnection,
        method: PaymentMethod,
        reference: &str,
    ) -> LedgerResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE method = $1 AND reference = $2"
        ))
        .bind(method.as_str())
        .bind(reference)
        .fetch_optional(conn)
        .await?;
        row.map(Payment::try_from).transpose()
    }

    /// Describe an earlier application of the same automated payment
    async fn earlier_application(&self, payment: Payment) -> LedgerResult<AppliedPayment> {
        let mut conn = self.pool.acquire().await?;
        let fee_line = Self::fetch_line(&mut conn, payment.fee_line_id, false)
            .await?
            .ok_or_else(|| {
                LedgerError::NotFound(format!("Fee line {} for payment {}", payment.fee_line_id, payment.id))
            })?;
        Ok(AppliedPayment {
            payment,
            fee_line,
            already_applied: true,
        })
    }
}

#[async_trait]
impl LearnerDirectory for PgLedgerStore {
    async fn learners_by_guardian_phone(&self, phone: &str) -> LedgerResult<Vec<Uuid>> {
        let Some(key) = phone::match_key(phone) else {
            return Ok(vec![]);
        };
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT gl.learner_id, g.phone
            FROM guardians g
            JOIN guardian_learners gl ON gl.guardian_id = g.id
            WHERE right(regexp_replace(g.phone, '[^0-9]', '', 'g'), 9) = $1
            "#,
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(matching_phone(rows, phone, &self.country_code))
    }

    async fn learners_by_own_phone(&self, phone: &str) -> LedgerResult<Vec<Uuid>> {
        let Some(key) = phone::match_key(phone) else {
            return Ok(vec![]);
        };
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, phone
            FROM learners
            WHERE right(regexp_replace(phone, '[^0-9]', '', 'g'), 9) = $1
            "#,
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(matching_phone(rows, phone, &self.country_code))
    }

    async fn enrolled_learners(&self, class_id: Uuid, academic_year: i32) -> LedgerResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT learner_id
            FROM enrollments
            WHERE class_id = $1 AND academic_year = $2 AND active
            ORDER BY enrolled_at ASC
            "#,
        )
        .bind(class_id)
        .bind(academic_year)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait]
impl AliasRepository for PgLedgerStore {
    async fn learners_for_phone(&self, phone: &str) -> LedgerResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT DISTINCT learner_id FROM phone_aliases WHERE phone = $1")
                .bind(phone)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn remember(&self, learner_id: Uuid, phone: &str) -> LedgerResult<PhoneAlias> {
        let (id, learner_id, phone, created_at, last_confirmed_at): (
            Uuid,
            Uuid,
            String,
            OffsetDateTime,
            OffsetDateTime,
        ) = sqlx::query_as(
            r#"
            INSERT INTO phone_aliases (learner_id, phone)
            VALUES ($1, $2)
            ON CONFLICT (learner_id, phone) DO UPDATE SET last_confirmed_at = NOW()
            RETURNING id, learner_id, phone, created_at, last_confirmed_at
            "#,
        )
        .bind(learner_id)
        .bind(phone)
        .fetch_one(&self.pool)
        .await?;

        Ok(PhoneAlias {
            id,
            learner_id,
            phone,
            created_at,
            last_confirmed_at,
        })
    }
}

#[async_trait]
impl FeeCategoryRepository for PgLedgerStore {
    async fn find_by_code(&self, code: &str) -> LedgerResult<Option<FeeCategory>> {
        let row: Option<CategoryRow> = sqlx::query_as(
            "SELECT id, code, name, frequency, recurring FROM fee_categories WHERE UPPER(code) = UPPER($1)",
        )
        .bind(code.trim())
        .fetch_optional(&self.pool)
        .await?;
        row.map(FeeCategory::try_from).transpose()
    }

    async fn list(&self) -> LedgerResult<Vec<FeeCategory>> {
        let rows: Vec<CategoryRow> = sqlx::query_as(
            "SELECT id, code, name, frequency, recurring FROM fee_categories ORDER BY code",
        )
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }
}

#[async_trait]
impl FeeScheduleRepository for PgLedgerStore {
    async fn for_class(&self, class_id: Uuid, academic_year: i32) -> LedgerResult<Vec<ClassFeeSchedule>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(
            r#"
            SELECT id, class_id, category_id, term, academic_year, amount_minor, updated_at
            FROM class_fee_structures
            WHERE class_id = $1 AND academic_year = $2
            ORDER BY category_id, COALESCE(term, 'TERM1')
            "#,
        )
        .bind(class_id)
        .bind(academic_year)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ClassFeeSchedule {
                    id: row.id,
                    class_id: row.class_id,
                    category_id: row.category_id,
                    term: parse_term(row.term)?,
                    academic_year: row.academic_year,
                    amount_minor: row.amount_minor,
                    updated_at: row.updated_at,
                })
            })
            .collect()
    }

    async fn scheduled_classes(&self, academic_year: i32) -> LedgerResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT DISTINCT class_id FROM class_fee_structures WHERE academic_year = $1",
        )
        .bind(academic_year)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait]
impl FeeLineRepository for PgLedgerStore {
    async fn get(&self, id: Uuid) -> LedgerResult<Option<FeeLine>> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_line(&mut conn, id, false).await
    }

    async fn list_for_learner(&self, learner_id: Uuid) -> LedgerResult<Vec<FeeLine>> {
        let rows: Vec<FeeLineRow> = sqlx::query_as(&format!(
            "SELECT {FEE_LINE_COLUMNS} FROM student_fees WHERE learner_id = $1 \
             ORDER BY academic_year, term NULLS FIRST, created_at"
        ))
        .bind(learner_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn outstanding_for_learner(&self, learner_id: Uuid) -> LedgerResult<Vec<FeeLine>> {
        let rows: Vec<FeeLineRow> = sqlx::query_as(&format!(
            "SELECT {FEE_LINE_COLUMNS} FROM student_fees \
             WHERE learner_id = $1 AND amount_due_minor > amount_paid_minor"
        ))
        .bind(learner_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn apply_payment(&self, payment: NewPayment) -> LedgerResult<AppliedPayment> {
        let mut tx = self.pool.begin().await?;

        let mut line = Self::fetch_line(&mut tx, payment.fee_line_id, true)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Fee line {}", payment.fee_line_id)))?;

        if payment.method.is_automated() {
            if let Some(existing) =
                Self::find_automated_payment(&mut tx, payment.method, &payment.reference).await?
            {
                tx.rollback().await?;
                return self.earlier_application(existing).await;
            }
        }

        let now = OffsetDateTime::now_utc();

        // A concurrent delivery holding the same reference makes this insert
        // wait for it, then return nothing.
        let inserted: Option<PaymentRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO payments (id, fee_line_id, amount_minor, method, reference, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (reference) WHERE method = 'mpesa' DO NOTHING
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(line.id)
        .bind(payment.amount_minor)
        .bind(payment.method.as_str())
        .bind(&payment.reference)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let inserted = match inserted {
            Some(row) => Payment::try_from(row)?,
            None => {
                tx.rollback().await?;
                let mut conn = self.pool.acquire().await?;
                let existing = Self::find_automated_payment(&mut conn, payment.method, &payment.reference)
                    .await?
                    .ok_or_else(|| {
                        LedgerError::Database(format!(
                            "Payment reference {} conflicted but no payment was found",
                            payment.reference
                        ))
                    })?;
                return self.earlier_application(existing).await;
            }
        };

        line.credit(payment.amount_minor, now);

        sqlx::query(
            r#"
            UPDATE student_fees
            SET amount_paid_minor = $1, status = $2, updated_at = $3
            WHERE id = $4
            "#,
        )
        .bind(line.amount_paid_minor)
        .bind(line.status.as_str())
        .bind(line.updated_at)
        .bind(line.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(AppliedPayment {
            payment: inserted,
            fee_line: line,
            already_applied: false,
        })
    }

    async fn sync_from_schedule(
        &self,
        learner_id: Uuid,
        schedule: &ClassFeeSchedule,
    ) -> LedgerResult<(FeeLine, ScheduleChange)> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let existing = match Self::lock_line_by_key(&mut tx, learner_id, schedule).await? {
            Some(line) => line,
            None => {
                let line = FeeLine::from_schedule(learner_id, schedule, now);
                let created: Option<(Uuid,)> = sqlx::query_as(
                    r#"
                    INSERT INTO student_fees
                        (id, learner_id, category_id, term, academic_year, base_amount_minor,
                         amount_due_minor, amount_paid_minor, locked, status, schedule_id,
                         discount_reason, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                    ON CONFLICT DO NOTHING
                    RETURNING id
                    "#,
                )
                .bind(line.id)
                .bind(line.learner_id)
                .bind(line.category_id)
                .bind(line.term.map(|t| t.as_str()))
                .bind(line.academic_year)
                .bind(line.base_amount_minor)
                .bind(line.amount_due_minor)
                .bind(line.amount_paid_minor)
                .bind(line.locked)
                .bind(line.status.as_str())
                .bind(line.schedule_id)
                .bind(&line.discount_reason)
                .bind(line.created_at)
                .bind(line.updated_at)
                .fetch_optional(&mut *tx)
                .await?;

                if created.is_some() {
                    tx.commit().await?;
                    return Ok((line, ScheduleChange::Created));
                }

                // Another writer created it first; lock theirs and adjust it
                Self::lock_line_by_key(&mut tx, learner_id, schedule)
                    .await?
                    .ok_or_else(|| {
                        LedgerError::Database(format!(
                            "Fee line for learner {} conflicted on insert but is missing",
                            learner_id
                        ))
                    })?
            }
        };

        let mut line = existing;
        let change = line.apply_schedule(schedule, now);

        if change.is_write() {
            sqlx::query(
                r#"
                UPDATE student_fees
                SET base_amount_minor = $1, amount_due_minor = $2, locked = $3,
                    status = $4, schedule_id = $5, updated_at = $6
                WHERE id = $7
                "#,
            )
            .bind(line.base_amount_minor)
            .bind(line.amount_due_minor)
            .bind(line.locked)
            .bind(line.status.as_str())
            .bind(line.schedule_id)
            .bind(line.updated_at)
            .bind(line.id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok((line, change))
    }
}

#[async_trait]
impl PaymentRepository for PgLedgerStore {
    async fn find_by_reference(&self, method: PaymentMethod, reference: &str) -> LedgerResult<Option<Payment>> {
        let mut conn = self.pool.acquire().await?;
        Self::find_automated_payment(&mut conn, method, reference).await
    }

    async fn list_for_fee_line(&self, fee_line_id: Uuid) -> LedgerResult<Vec<Payment>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE fee_line_id = $1 ORDER BY created_at"
        ))
        .bind(fee_line_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }
}

#[async_trait]
impl TransactionRecordRepository for PgLedgerStore {
    async fn exists(&self, trans_id: &str) -> LedgerResult<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM mpesa_transactions WHERE trans_id = $1)")
                .bind(trans_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn insert(&self, record: &TransactionRecord) -> LedgerResult<RecordInsert> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO mpesa_transactions
                (id, trans_id, amount_minor, phone, normalized_phone, channel_id, bill_reference,
                 payer_name, learner_id, fee_line_id, payment_id, status, pending_reason,
                 raw_payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (trans_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(record.id)
        .bind(&record.trans_id)
        .bind(record.amount_minor)
        .bind(&record.phone)
        .bind(&record.normalized_phone)
        .bind(&record.channel_id)
        .bind(&record.bill_reference)
        .bind(&record.payer_name)
        .bind(record.learner_id)
        .bind(record.fee_line_id)
        .bind(record.payment_id)
        .bind(record.status.as_str())
        .bind(record.pending_reason.map(|r| r.as_str()))
        .bind(&record.raw_payload)
        .bind(record.created_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match inserted {
            Some(_) => RecordInsert::Inserted(record.clone()),
            None => RecordInsert::Duplicate,
        })
    }

    async fn settle_pending(&self, success: &TransactionRecord) -> LedgerResult<Option<TransactionRecord>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE mpesa_transactions
            SET status = 'SUCCESS',
                pending_reason = NULL,
                learner_id = $2,
                fee_line_id = $3,
                payment_id = $4,
                normalized_phone = COALESCE(normalized_phone, $5)
            WHERE trans_id = $1 AND status = 'PENDING' AND payment_id IS NULL
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(&success.trans_id)
        .bind(success.learner_id)
        .bind(success.fee_line_id)
        .bind(success.payment_id)
        .bind(&success.normalized_phone)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TransactionRecord::try_from).transpose()
    }

    async fn find(&self, trans_id: &str) -> LedgerResult<Option<TransactionRecord>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM mpesa_transactions WHERE trans_id = $1"
        ))
        .bind(trans_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TransactionRecord::try_from).transpose()
    }

    async fn list_pending(
        &self,
        reason: Option<PendingReason>,
        limit: i64,
        offset: i64,
    ) -> LedgerResult<Vec<TransactionRecord>> {
        let rows: Vec<TransactionRow> = match reason {
            Some(reason) => sqlx::query_as(&format!(
                r#"
                SELECT {TRANSACTION_COLUMNS}
                FROM mpesa_transactions
                WHERE status = 'PENDING' AND pending_reason = $1
                ORDER BY created_at DESC
                LIMIT $2 OFFSET $3
                "#
            ))
            .bind(reason.as_str())
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?,
            None => sqlx::query_as(&format!(
                r#"
                SELECT {TRANSACTION_COLUMNS}
                FROM mpesa_transactions
                WHERE status = 'PENDING'
                ORDER BY created_at DESC
                LIMIT $1 OFFSET $2
                "#
            ))
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?,
        };
        collect(rows)
    }
}
