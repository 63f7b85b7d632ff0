//! Auth routes: register, login, refresh

use axum::{extract::State, http::StatusCode, Json};

use super::super::{
    AppState, LoginRequest, RefreshRequest, RegisterRequest, RegisterResponse, TokenResponse,
};
use crate::error::ApiResult;

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<RegisterResponse>)> {
    let user_id = state.auth.register(&request.email, &request.password).await?;
    Ok((StatusCode::CREATED, Json(RegisterResponse { user_id })))
}

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let pair = state.auth.login(&request.email, &request.password).await?;
    Ok(Json(TokenResponse {
        access_token: pair.access_token,
        refresh_token: pair.refresh_token,
    }))
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let pair = state.auth.refresh(&request.refresh_token).await?;
    Ok(Json(TokenResponse {
        access_token: pair.access_token,
        refresh_token: pair.refresh_token,
    }))
}
