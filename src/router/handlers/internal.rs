//! Internal routes: validate token + ownership for the terminal gateway

use axum::{extract::State, Json};
use uuid::Uuid;

use super::super::{AppState, InternalValidateRequest, InternalValidateResponse};
use crate::error::{ApiError, ApiResult};

pub async fn validate(
    State(state): State<AppState>,
    Json(request): Json<InternalValidateRequest>,
) -> ApiResult<Json<InternalValidateResponse>> {
    let project_id = Uuid::parse_str(&request.project_id)
        .map_err(|_| ApiError::Unauthorized("Unauthorized".into()))?;

    let user_id = state.auth.verify(&request.token, project_id).await?;
    Ok(Json(InternalValidateResponse {
        user_id: user_id.to_string(),
    }))
}
