//! M-Pesa C2B callback routes
//!
//! The provider retries any non-success response, so only two cases answer
//! with an error: a body that cannot be read as a confirmation (400, retrying
//! will not help) and a storage failure (500, the retry should succeed).
//! Everything else, pending payments and duplicates included, is accepted.

use axum::{body::Bytes, extract::State, Json};
use schoolpay_ledger::{Actor, C2bConfirmation, ReconciliationOutcome};
use serde::Serialize;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

// =============================================================================
// Response Types
// =============================================================================

/// Acknowledgement body the provider expects
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct C2bAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: &'static str,
}

impl C2bAck {
    pub fn accepted() -> Self {
        Self {
            result_code: 0,
            result_desc: "Accepted",
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Validation callback; every payment is accepted and reconciled on confirmation
pub async fn validation(body: Bytes) -> Json<C2bAck> {
    tracing::debug!(bytes = body.len(), "C2B validation request accepted");
    Json(C2bAck::accepted())
}

/// Confirmation callback
pub async fn confirmation(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<C2bAck>> {
    let notification = C2bConfirmation::parse(&body).map_err(|e| {
        tracing::warn!(error = %e, "Rejected malformed C2B confirmation");
        ApiError::from(e)
    })?;

    let outcome = state
        .ledger
        .reconciler
        .process(&notification, &Actor::provider("mpesa"))
        .await
        .map_err(|e| {
            tracing::error!(
                trans_id = %notification.transaction_id,
                error = %e,
                retryable = e.is_retryable(),
                "C2B confirmation failed"
            );
            ApiError::from(e)
        })?;

    match &outcome {
        ReconciliationOutcome::Success {
            trans_id,
            learner_id,
            already_applied,
            ..
        } => tracing::info!(
            trans_id = %trans_id,
            learner_id = %learner_id,
            already_applied = already_applied,
            "C2B confirmation applied"
        ),
        ReconciliationOutcome::Pending {
            trans_id, reason, ..
        } => tracing::info!(
            trans_id = %trans_id,
            reason = %reason,
            "C2B confirmation held for review"
        ),
        ReconciliationOutcome::Duplicate { trans_id } => {
            tracing::info!(trans_id = %trans_id, "C2B confirmation already processed")
        }
    }

    Ok(Json(C2bAck::accepted()))
}
