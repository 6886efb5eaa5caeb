//! Fee lines: one learner's obligation for one category, term and year
//!
//! Monetary fields are integer minor units (cents). `amount_paid_minor` only
//! grows through [`FeeLine::credit`], which the ledger applier reaches via the
//! fee line repository. `amount_due_minor` and `base_amount_minor` follow the
//! class fee schedule through [`FeeLine::apply_schedule`] until the line is
//! locked.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::ClassFeeSchedule;

/// School term. Yearly and one-time fees carry no term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Term {
    Term1,
    Term2,
    Term3,
}

impl Term {
    pub fn as_str(&self) -> &'static str {
        match self {
            Term::Term1 => "TERM1",
            Term::Term2 => "TERM2",
            Term::Term3 => "TERM3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TERM1" => Some(Term::Term1),
            "TERM2" => Some(Term::Term2),
            "TERM3" => Some(Term::Term3),
            _ => None,
        }
    }

    /// Term used to key a fee line: a missing term maps to TERM1
    pub fn or_default(term: Option<Term>) -> Term {
        term.unwrap_or(Term::Term1)
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment status of a fee line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeStatus {
    Unpaid,
    PartiallyPaid,
    Paid,
}

impl FeeStatus {
    /// Status implied by the due and paid amounts
    pub fn derive(amount_due_minor: i64, amount_paid_minor: i64) -> Self {
        if amount_paid_minor >= amount_due_minor {
            FeeStatus::Paid
        } else if amount_paid_minor > 0 {
            FeeStatus::PartiallyPaid
        } else {
            FeeStatus::Unpaid
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeeStatus::Unpaid => "unpaid",
            FeeStatus::PartiallyPaid => "partially_paid",
            FeeStatus::Paid => "paid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unpaid" => Some(FeeStatus::Unpaid),
            "partially_paid" => Some(FeeStatus::PartiallyPaid),
            "paid" => Some(FeeStatus::Paid),
            _ => None,
        }
    }
}

impl std::fmt::Display for FeeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a schedule application did to a fee line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleChange {
    /// No line existed; one was created from the schedule
    Created,
    /// Amounts moved to the new schedule amount
    Updated,
    /// Payments already exceed the new amount; the line is now locked
    Locked,
    /// Line was locked already; only the schedule reference moved
    Relinked,
    /// Nothing to write
    Unchanged,
}

impl ScheduleChange {
    /// Whether the fee line row was created or modified
    pub fn is_write(&self) -> bool {
        !matches!(self, ScheduleChange::Unchanged)
    }
}

/// One learner's obligation for one fee category, term and academic year
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeLine {
    pub id: Uuid,
    pub learner_id: Uuid,
    pub category_id: Uuid,
    pub term: Option<Term>,
    pub academic_year: i32,
    pub base_amount_minor: i64,
    pub amount_due_minor: i64,
    pub amount_paid_minor: i64,
    pub locked: bool,
    pub status: FeeStatus,
    pub schedule_id: Option<Uuid>,
    pub discount_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl FeeLine {
    /// New, unpaid line generated from a class fee schedule row
    pub fn from_schedule(learner_id: Uuid, schedule: &ClassFeeSchedule, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            learner_id,
            category_id: schedule.category_id,
            term: schedule.term,
            academic_year: schedule.academic_year,
            base_amount_minor: schedule.amount_minor,
            amount_due_minor: schedule.amount_minor,
            amount_paid_minor: 0,
            locked: false,
            status: FeeStatus::derive(schedule.amount_minor, 0),
            schedule_id: Some(schedule.id),
            discount_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Remaining balance; negative when overpaid
    pub fn outstanding_minor(&self) -> i64 {
        self.amount_due_minor - self.amount_paid_minor
    }

    pub fn is_outstanding(&self) -> bool {
        self.amount_due_minor > self.amount_paid_minor
    }

    /// Key the store enforces uniqueness on, with the term defaulted
    pub fn key_term(&self) -> Term {
        Term::or_default(self.term)
    }

    /// Ordering for oldest-outstanding-first allocation:
    /// academic year, then term with yearly (no term) first, then creation time
    pub fn allocation_key(&self) -> (i32, u8, OffsetDateTime) {
        let term_rank = match self.term {
            None => 0,
            Some(Term::Term1) => 1,
            Some(Term::Term2) => 2,
            Some(Term::Term3) => 3,
        };
        (self.academic_year, term_rank, self.created_at)
    }

    /// Add a payment to the line and recompute its status.
    ///
    /// Overpayment is kept as-is; no change is split off to other lines.
    pub(crate) fn credit(&mut self, amount_minor: i64, now: OffsetDateTime) {
        self.amount_paid_minor += amount_minor;
        self.status = if self.locked {
            FeeStatus::Paid
        } else {
            FeeStatus::derive(self.amount_due_minor, self.amount_paid_minor)
        };
        self.updated_at = now;
    }

    /// Bring the line in line with a (possibly changed) schedule row.
    ///
    /// Locked lines keep their monetary fields. An unlocked line whose
    /// payments already exceed the new amount becomes locked at that amount
    /// and is forced to `paid`.
    pub fn apply_schedule(&mut self, schedule: &ClassFeeSchedule, now: OffsetDateTime) -> ScheduleChange {
        if self.locked {
            if self.schedule_id == Some(schedule.id) {
                return ScheduleChange::Unchanged;
            }
            self.schedule_id = Some(schedule.id);
            self.updated_at = now;
            return ScheduleChange::Relinked;
        }

        let amount = schedule.amount_minor;

        if self.amount_paid_minor > amount {
            self.locked = true;
            self.base_amount_minor = amount;
            self.amount_due_minor = amount;
            self.status = FeeStatus::Paid;
            self.schedule_id = Some(schedule.id);
            self.updated_at = now;
            return ScheduleChange::Locked;
        }

        let status = FeeStatus::derive(amount, self.amount_paid_minor);
        if self.base_amount_minor == amount
            && self.amount_due_minor == amount
            && self.status == status
            && self.schedule_id == Some(schedule.id)
        {
            return ScheduleChange::Unchanged;
        }

        self.base_amount_minor = amount;
        self.amount_due_minor = amount;
        self.status = status;
        self.schedule_id = Some(schedule.id);
        self.updated_at = now;
        ScheduleChange::Updated
    }
}

/// Sum of `amount_due - amount_paid` across lines
pub fn outstanding_balance(lines: &[FeeLine]) -> i64 {
    lines.iter().map(FeeLine::outstanding_minor).sum()
}
