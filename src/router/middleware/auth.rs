//! Bearer authentication extractor

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::RequestPartsExt;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use uuid::Uuid;

use super::super::AppState;
use crate::error::ApiError;

/// The authenticated caller, extracted from the Bearer access token.
pub struct AuthUser(pub Uuid);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| {
                ApiError::Unauthorized("Missing or invalid authorization header".into())
            })?;

        let user_id = state.auth.authenticate(bearer.token())?;
        Ok(AuthUser(user_id))
    }
}
