//! Ledger records: categories, schedules, payments, transaction records, aliases

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::fee_line::{FeeLine, Term};

/// How often a fee category is charged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeFrequency {
    Termly,
    Yearly,
    OneTime,
}

impl FeeFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeFrequency::Termly => "termly",
            FeeFrequency::Yearly => "yearly",
            FeeFrequency::OneTime => "one_time",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "termly" => Some(FeeFrequency::Termly),
            "yearly" => Some(FeeFrequency::Yearly),
            "one_time" => Some(FeeFrequency::OneTime),
            _ => None,
        }
    }
}

/// Named obligation type (tuition, meals, transport, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeCategory {
    pub id: Uuid,
    /// Stable short code used by the channel policy table, e.g. `TUITION`
    pub code: String,
    pub name: String,
    pub frequency: FeeFrequency,
    pub recurring: bool,
}

/// Amount for one (class, category, term, year)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassFeeSchedule {
    pub id: Uuid,
    pub class_id: Uuid,
    pub category_id: Uuid,
    pub term: Option<Term>,
    pub academic_year: i32,
    pub amount_minor: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// How a payment reached the school
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Mpesa,
    Cash,
    Bank,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Mpesa => "mpesa",
            PaymentMethod::Cash => "cash",
            PaymentMethod::Bank => "bank",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mpesa" => Some(PaymentMethod::Mpesa),
            "cash" => Some(PaymentMethod::Cash),
            "bank" => Some(PaymentMethod::Bank),
            _ => None,
        }
    }

    /// Automated methods carry the provider transaction id as a unique reference
    pub fn is_automated(&self) -> bool {
        matches!(self, PaymentMethod::Mpesa)
    }
}

/// Immutable settlement event against one fee line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub fee_line_id: Uuid,
    pub amount_minor: i64,
    pub method: PaymentMethod,
    pub reference: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Input to the atomic apply step
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub fee_line_id: Uuid,
    pub amount_minor: i64,
    pub method: PaymentMethod,
    pub reference: String,
}

/// Result of the atomic apply step
#[derive(Debug, Clone)]
pub struct AppliedPayment {
    pub payment: Payment,
    pub fee_line: FeeLine,
    /// An automated payment with the same reference already existed; nothing
    /// was written and `payment`/`fee_line` describe the earlier application.
    pub already_applied: bool,
}

/// Outcome recorded for an inbound notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Success,
    Pending,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Success => "SUCCESS",
            TransactionStatus::Pending => "PENDING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(TransactionStatus::Success),
            "PENDING" => Some(TransactionStatus::Pending),
            _ => None,
        }
    }
}

/// Why a payment is waiting for staff instead of being applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PendingReason {
    /// No learner is linked to the paying phone number
    NoStudent,
    /// The phone number is linked to more than one learner
    MultipleStudents,
    /// The learner has no outstanding fee line the channel may settle
    NoFees,
    /// The channel / bill reference combination is not configured
    Other,
}

impl PendingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingReason::NoStudent => "NO_STUDENT",
            PendingReason::MultipleStudents => "MULTIPLE_STUDENTS",
            PendingReason::NoFees => "NO_FEES",
            PendingReason::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NO_STUDENT" => Some(PendingReason::NoStudent),
            "MULTIPLE_STUDENTS" => Some(PendingReason::MultipleStudents),
            "NO_FEES" => Some(PendingReason::NoFees),
            "OTHER" => Some(PendingReason::Other),
            _ => None,
        }
    }

    /// Text shown to staff working the review queue
    pub fn description(&self) -> &'static str {
        match self {
            PendingReason::NoStudent => "No learner or guardian is registered with this phone number",
            PendingReason::MultipleStudents => {
                "This phone number belongs to more than one learner; choose the learner manually"
            }
            PendingReason::NoFees => "The learner has no outstanding fees this payment channel can settle",
            PendingReason::Other => "Payment arrived on an unrecognised channel or bill reference",
        }
    }
}

impl std::fmt::Display for PendingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per inbound notification; the idempotency key and audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub trans_id: String,
    pub amount_minor: i64,
    /// Phone exactly as the provider sent it
    pub phone: String,
    pub normalized_phone: Option<String>,
    pub channel_id: String,
    pub bill_reference: String,
    pub payer_name: Option<String>,
    /// Learner the payment resolved to, when exactly one did
    pub learner_id: Option<Uuid>,
    pub fee_line_id: Option<Uuid>,
    pub payment_id: Option<Uuid>,
    pub status: TransactionStatus,
    pub pending_reason: Option<PendingReason>,
    pub raw_payload: Option<serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Result of inserting a transaction record
#[derive(Debug, Clone)]
pub enum RecordInsert {
    Inserted(TransactionRecord),
    /// Another delivery of the same transaction id won the insert
    Duplicate,
}

/// Learned phone to learner mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneAlias {
    pub id: Uuid,
    pub learner_id: Uuid,
    pub phone: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_confirmed_at: OffsetDateTime,
}

/// Who triggered an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// Mobile-money provider callback
    Provider,
    /// Authenticated staff member
    Staff,
    /// Scheduled job
    System,
}

/// Authenticated actor context passed into the orchestrator and propagator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
}

impl Actor {
    pub fn provider(name: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::Provider,
            actor_id: Some(name.into()),
        }
    }

    pub fn staff(id: Option<String>) -> Self {
        Self {
            actor_type: ActorType::Staff,
            actor_id: id,
        }
    }

    pub fn system(job: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::System,
            actor_id: Some(job.into()),
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.actor_type {
            ActorType::Provider => "provider",
            ActorType::Staff => "staff",
            ActorType::System => "system",
        };
        match &self.actor_id {
            Some(id) => write!(f, "{kind}:{id}"),
            None => f.write_str(kind),
        }
    }
}
