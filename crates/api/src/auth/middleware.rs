//! Staff authentication middleware

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use schoolpay_ledger::Actor;
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Header naming the staff member acting, recorded on the actor
pub const STAFF_ID_HEADER: &str = "X-Staff-Id";

#[derive(Debug)]
pub enum AuthError {
    MissingAuth,
    InvalidToken,
    Disabled,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Missing authentication"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid token"),
            AuthError::Disabled => (StatusCode::UNAUTHORIZED, "Staff access is not configured"),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

fn extract_bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
}

fn extract_staff_id(request: &Request) -> Option<String> {
    request
        .headers()
        .get(STAFF_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
}

/// Compare a presented token with the configured one in constant time
fn token_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Require the staff bearer token, then attach a staff [`Actor`] to the request
pub async fn require_staff(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let expected = state.config.staff_api_token.as_str();
    if expected.is_empty() {
        tracing::warn!(path = %request.uri().path(), "require_staff: staff token not configured");
        return AuthError::Disabled.into_response();
    }

    let Some(token) = extract_bearer_token(&request) else {
        tracing::warn!(path = %request.uri().path(), "require_staff: no bearer token");
        return AuthError::MissingAuth.into_response();
    };

    if !token_matches(&token, expected) {
        tracing::warn!(path = %request.uri().path(), "require_staff: token rejected");
        return AuthError::InvalidToken.into_response();
    }

    let actor = Actor::staff(extract_staff_id(&request));
    tracing::debug!(actor = %actor, path = %request.uri().path(), "require_staff: authenticated");
    request.extensions_mut().insert(actor);

    next.run(request).await
}
