//! HTTP routes

pub mod fee_structures;
pub mod mpesa;
pub mod review;


use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_staff, state::AppState};

/// Build the application router
///
/// Health and the provider callbacks are public; every other route requires
/// the staff token.
pub fn create_router(state: AppState) -> Router {
    let provider = Router::new()
        .route("/v1/mpesa/c2b/validation", post(mpesa::validation))
        .route("/v1/mpesa/c2b/confirmation", post(mpesa::confirmation));

    let staff = Router::new()
        // Review queue
        .route("/v1/payments/pending", get(review::list_pending))
        .route(
            "/v1/payments/transactions/{trans_id}",
            get(review::get_transaction),
        )
        .route("/v1/ledger/invariants", get(review::run_invariants))
        .route(
            "/v1/ledger/invariants/{check}",
            get(review::run_invariant),
        )
        // Fee propagation
        .route(
            "/v1/fee-structures/{class_id}/{academic_year}/apply",
            post(fee_structures::apply_class),
        )
        .route(
            "/v1/fee-structures/{academic_year}/apply-all",
            post(fee_structures::apply_all),
        )
        .route(
            "/v1/learners/{learner_id}/enrolled",
            post(fee_structures::learner_enrolled),
        )
        .route(
            "/v1/learners/{learner_id}/transferred",
            post(fee_structures::learner_transferred),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_staff));

    Router::new()
        .route("/health", get(health))
        .merge(provider)
        .merge(staff)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
