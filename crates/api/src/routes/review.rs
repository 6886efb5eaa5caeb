//! Staff review routes
//!
//! The pending queue, single transaction lookups and ledger invariant checks.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use schoolpay_ledger::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, PendingReason, TransactionRecord,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    pub reason: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PendingTransaction {
    #[serde(flatten)]
    pub record: TransactionRecord,
    pub reason_description: Option<&'static str>,
}

impl From<TransactionRecord> for PendingTransaction {
    fn from(record: TransactionRecord) -> Self {
        let reason_description = record.pending_reason.map(|r| r.description());
        Self {
            record,
            reason_description,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PendingListResponse {
    pub transactions: Vec<PendingTransaction>,
    pub count: usize,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct InvariantCheckResponse {
    pub check: String,
    pub violations: Vec<InvariantViolation>,
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /v1/payments/pending
pub async fn list_pending(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> ApiResult<Json<PendingListResponse>> {
    let reason = match query.reason.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(PendingReason::parse(raw).ok_or_else(|| {
            ApiError::Validation(format!("Unknown pending reason '{}'", raw))
        })?),
    };

    let records = state
        .ledger
        .recorder()
        .list_pending(reason, query.limit, query.offset)
        .await?;

    let transactions: Vec<PendingTransaction> =
        records.into_iter().map(PendingTransaction::from).collect();

    Ok(Json(PendingListResponse {
        count: transactions.len(),
        transactions,
        offset: query.offset.unwrap_or(0).max(0),
    }))
}

/// GET /v1/payments/transactions/{trans_id}
pub async fn get_transaction(
    State(state): State<AppState>,
    Path(trans_id): Path<String>,
) -> ApiResult<Json<PendingTransaction>> {
    let record = state
        .ledger
        .recorder()
        .find(&trans_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Transaction {}", trans_id)))?;

    Ok(Json(record.into()))
}

/// GET /v1/ledger/invariants
pub async fn run_invariants(State(state): State<AppState>) -> ApiResult<Json<InvariantCheckSummary>> {
    let checker = checker(&state)?;
    let summary = checker.run_all_checks().await?;

    if !summary.violations.is_empty() {
        tracing::warn!(
            violations = summary.violations.len(),
            "Ledger invariant violations found"
        );
    }

    Ok(Json(summary))
}

/// GET /v1/ledger/invariants/{check}
pub async fn run_invariant(
    State(state): State<AppState>,
    Path(check): Path<String>,
) -> ApiResult<Json<InvariantCheckResponse>> {
    if !InvariantChecker::available_checks().contains(&check.as_str()) {
        return Err(ApiError::NotFound(format!("Invariant check {}", check)));
    }

    let checker = checker(&state)?;
    let violations = checker.run_check(&check).await?;

    Ok(Json(InvariantCheckResponse { check, violations }))
}

fn checker(state: &AppState) -> ApiResult<&InvariantChecker> {
    state.invariants.as_deref().ok_or_else(|| {
        ApiError::ServiceUnavailable("Invariant checks require a database".to_string())
    })
}
