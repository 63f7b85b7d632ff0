//! Internal-route protection
//!
//! `/internal/*` requires a shared-secret header. A wrong secret, a
//! missing header, or no configured secret at all sees a plain 404,
//! making the routes indistinguishable from non-existent paths.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::super::AppState;

const SECRET_HEADER: &str = "X-Internal-Secret";

pub async fn require_internal_secret(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let expected = state.config.auth.internal_secret.as_deref();
    let presented = request
        .headers()
        .get(SECRET_HEADER)
        .and_then(|value| value.to_str().ok());

    match (expected, presented) {
        (Some(expected), Some(presented)) if expected == presented => next.run(request).await,
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "Not found" })),
        )
            .into_response(),
    }
}
