//! Ledger Invariants Module
//!
//! Runnable consistency checks for the fee ledger. Run them after a replay,
//! a manual correction, or an incident to confirm the ledger is coherent.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query
//! 2. **Explanatory**: Violations carry enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::LedgerResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Fee lines, payments or transaction records involved
    pub entity_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money is recorded wrongly
    Critical,
    /// Ledger state contradicts itself
    High,
    /// Heals on redelivery, worth a look
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(violations: Vec<InvariantViolation>, checks_run: usize) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StatusMismatchRow {
    id: Uuid,
    amount_due_minor: i64,
    amount_paid_minor: i64,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct LockedUnpaidRow {
    id: Uuid,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct PaidSumMismatchRow {
    id: Uuid,
    amount_paid_minor: i64,
    payments_total: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct RecordPaymentMismatchRow {
    record_id: Uuid,
    trans_id: String,
    record_fee_line_id: Option<Uuid>,
    payment_fee_line_id: Uuid,
    payment_reference: String,
}

#[derive(Debug, sqlx::FromRow)]
struct PendingButPaidRow {
    record_id: Uuid,
    trans_id: String,
    payment_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct UnrecordedPaymentRow {
    payment_id: Uuid,
    reference: String,
    amount_minor: i64,
}

/// Service for running ledger invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> LedgerResult<InvariantCheckSummary> {
        let mut violations = Vec::new();

        violations.extend(self.check_status_consistent().await?);
        violations.extend(self.check_locked_lines_paid().await?);
        violations.extend(self.check_paid_matches_payments().await?);
        violations.extend(self.check_success_records_match_payment().await?);
        violations.extend(self.check_pending_records_unapplied().await?);
        violations.extend(self.check_automated_payments_recorded().await?);

        Ok(InvariantCheckSummary::from_violations(
            violations,
            Self::available_checks().len(),
        ))
    }

    /// Invariant 1: unlocked line status follows due vs paid
    async fn check_status_consistent(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<StatusMismatchRow> = sqlx::query_as(
            r#"
            SELECT id, amount_due_minor, amount_paid_minor, status
            FROM student_fees
            WHERE NOT locked
              AND status <> CASE
                  WHEN amount_paid_minor >= amount_due_minor THEN 'paid'
                  WHEN amount_paid_minor > 0 THEN 'partially_paid'
                  ELSE 'unpaid'
              END
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "status_consistent".to_string(),
                entity_ids: vec![row.id],
                description: format!(
                    "Fee line is '{}' with {} paid of {} due",
                    row.status, row.amount_paid_minor, row.amount_due_minor
                ),
                context: serde_json::json!({
                    "amount_due_minor": row.amount_due_minor,
                    "amount_paid_minor": row.amount_paid_minor,
                    "status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 2: locked lines are always paid
    async fn check_locked_lines_paid(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<LockedUnpaidRow> = sqlx::query_as(
            r#"
            SELECT id, status
            FROM student_fees
            WHERE locked AND status <> 'paid'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "locked_lines_paid".to_string(),
                entity_ids: vec![row.id],
                description: format!("Locked fee line has status '{}'", row.status),
                context: serde_json::json!({ "status": row.status }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: amount_paid equals the sum of the line's payments
    async fn check_paid_matches_payments(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidSumMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                f.id,
                f.amount_paid_minor,
                COALESCE(SUM(p.amount_minor), 0)::BIGINT AS payments_total
            FROM student_fees f
            LEFT JOIN payments p ON p.fee_line_id = f.id
            GROUP BY f.id, f.amount_paid_minor
            HAVING f.amount_paid_minor <> COALESCE(SUM(p.amount_minor), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_matches_payments".to_string(),
                entity_ids: vec![row.id],
                description: format!(
                    "Fee line shows {} paid but its payments total {}",
                    row.amount_paid_minor, row.payments_total
                ),
                context: serde_json::json!({
                    "amount_paid_minor": row.amount_paid_minor,
                    "payments_total": row.payments_total,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: a SUCCESS record points at its own payment and that
    /// payment's fee line
    async fn check_success_records_match_payment(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<RecordPaymentMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                t.id AS record_id,
                t.trans_id,
                t.fee_line_id AS record_fee_line_id,
                p.fee_line_id AS payment_fee_line_id,
                p.reference AS payment_reference
            FROM mpesa_transactions t
            JOIN payments p ON p.id = t.payment_id
            WHERE t.status = 'SUCCESS'
              AND (t.fee_line_id IS DISTINCT FROM p.fee_line_id OR p.reference <> t.trans_id)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "success_records_match_payment".to_string(),
                entity_ids: vec![row.record_id],
                description: format!(
                    "Transaction {} does not match the payment it references",
                    row.trans_id
                ),
                context: serde_json::json!({
                    "trans_id": row.trans_id,
                    "record_fee_line_id": row.record_fee_line_id,
                    "payment_fee_line_id": row.payment_fee_line_id,
                    "payment_reference": row.payment_reference,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: a PENDING record has no payment behind it
    async fn check_pending_records_unapplied(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<PendingButPaidRow> = sqlx::query_as(
            r#"
            SELECT t.id AS record_id, t.trans_id, p.id AS payment_id
            FROM mpesa_transactions t
            JOIN payments p ON p.reference = t.trans_id AND p.method = 'mpesa'
            WHERE t.status = 'PENDING'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "pending_records_unapplied".to_string(),
                entity_ids: vec![row.record_id, row.payment_id],
                description: format!(
                    "Transaction {} is pending review but a payment was applied",
                    row.trans_id
                ),
                context: serde_json::json!({
                    "trans_id": row.trans_id,
                    "payment_id": row.payment_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 6: every automated payment has its transaction record.
    ///
    /// A miss means the process died between applying and recording; the
    /// provider's redelivery closes it without a second credit.
    async fn check_automated_payments_recorded(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<UnrecordedPaymentRow> = sqlx::query_as(
            r#"
            SELECT p.id AS payment_id, p.reference, p.amount_minor
            FROM payments p
            WHERE p.method = 'mpesa'
              AND NOT EXISTS (
                  SELECT 1 FROM mpesa_transactions t WHERE t.trans_id = p.reference
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "automated_payments_recorded".to_string(),
                entity_ids: vec![row.payment_id],
                description: format!(
                    "Payment for transaction {} has no transaction record",
                    row.reference
                ),
                context: serde_json::json!({
                    "reference": row.reference,
                    "amount_minor": row.amount_minor,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> LedgerResult<Vec<InvariantViolation>> {
        match name {
            "status_consistent" => self.check_status_consistent().await,
            "locked_lines_paid" => self.check_locked_lines_paid().await,
            "paid_matches_payments" => self.check_paid_matches_payments().await,
            "success_records_match_payment" => self.check_success_records_match_payment().await,
            "pending_records_unapplied" => self.check_pending_records_unapplied().await,
            "automated_payments_recorded" => self.check_automated_payments_recorded().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "status_consistent",
            "locked_lines_paid",
            "paid_matches_payments",
            "success_records_match_payment",
            "pending_records_unapplied",
            "automated_payments_recorded",
        ]
    }
}
