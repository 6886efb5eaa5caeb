//! Fee structure propagation routes

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use schoolpay_ledger::{Actor, PropagationReport};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct PlacementRequest {
    pub class_id: Uuid,
    pub academic_year: i32,
}

#[derive(Debug, Serialize)]
pub struct ApplyAllResponse {
    pub academic_year: i32,
    pub classes: usize,
    pub affected: usize,
    pub failures: usize,
    pub failed_classes: usize,
    pub reports: Vec<PropagationReport>,
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /v1/fee-structures/{class_id}/{academic_year}/apply
pub async fn apply_class(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path((class_id, academic_year)): Path<(Uuid, i32)>,
) -> ApiResult<Json<PropagationReport>> {
    validate_year(academic_year)?;

    let report = state
        .ledger
        .propagator
        .apply(class_id, academic_year, &actor)
        .await?;

    Ok(Json(report))
}

/// POST /v1/fee-structures/{academic_year}/apply-all
pub async fn apply_all(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(academic_year): Path<i32>,
) -> ApiResult<Json<ApplyAllResponse>> {
    validate_year(academic_year)?;

    let reports = state
        .ledger
        .propagator
        .apply_all(academic_year, &actor)
        .await?;

    Ok(Json(ApplyAllResponse {
        academic_year,
        classes: reports.len(),
        affected: reports.iter().map(|r| r.affected).sum(),
        failures: reports.iter().map(|r| r.failures.len()).sum(),
        failed_classes: reports.iter().filter(|r| r.error.is_some()).count(),
        reports,
    }))
}

/// POST /v1/learners/{learner_id}/enrolled
pub async fn learner_enrolled(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(learner_id): Path<Uuid>,
    Json(req): Json<PlacementRequest>,
) -> ApiResult<Json<PropagationReport>> {
    validate_year(req.academic_year)?;

    let report = state
        .ledger
        .propagator
        .on_learner_enrolled(learner_id, req.class_id, req.academic_year, &actor)
        .await?;

    Ok(Json(report))
}

/// POST /v1/learners/{learner_id}/transferred
pub async fn learner_transferred(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(learner_id): Path<Uuid>,
    Json(req): Json<PlacementRequest>,
) -> ApiResult<Json<PropagationReport>> {
    validate_year(req.academic_year)?;

    let report = state
        .ledger
        .propagator
        .on_learner_transferred(learner_id, req.class_id, req.academic_year, &actor)
        .await?;

    Ok(Json(report))
}

fn validate_year(academic_year: i32) -> ApiResult<()> {
    if !(2000..=2100).contains(&academic_year) {
        return Err(ApiError::Validation(format!(
            "Academic year {} is out of range",
            academic_year
        )));
    }
    Ok(())
}
