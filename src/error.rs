use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error kinds the core distinguishes, mapped onto HTTP statuses at the
/// router boundary.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Project or user missing or not owned by the caller. Foreign
    /// projects are indistinguishable from missing ones.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate email on registration.
    #[error("{0}")]
    Conflict(String),

    /// Bad credentials or invalid/expired token.
    #[error("{0}")]
    Unauthorized(String),

    /// Operation disallowed in the project's current status.
    #[error("{0}")]
    InvalidState(String),

    /// Container runtime, cloud, or registry failure.
    #[error("{0}")]
    External(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            // Invalid state reads as "not found in this state" to the caller
            ApiError::InvalidState(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::External(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "detail": message,
        }));

        (status, body).into_response()
    }
}

impl From<crate::db::StoreError> for ApiError {
    fn from(e: crate::db::StoreError) -> Self {
        match e {
            crate::db::StoreError::NotFound(msg) => ApiError::NotFound(msg),
            crate::db::StoreError::Conflict(msg) => ApiError::Conflict(msg),
            crate::db::StoreError::Database(msg) => ApiError::External(msg),
        }
    }
}

impl From<crate::docker::RuntimeError> for ApiError {
    fn from(e: crate::docker::RuntimeError) -> Self {
        ApiError::External(e.to_string())
    }
}

impl From<crate::cloud::StorageIamError> for ApiError {
    fn from(e: crate::cloud::StorageIamError) -> Self {
        ApiError::External(e.to_string())
    }
}

impl From<crate::registry::RegistryError> for ApiError {
    fn from(e: crate::registry::RegistryError) -> Self {
        ApiError::External(e.to_string())
    }
}

impl From<crate::snapshot::SnapshotError> for ApiError {
    fn from(e: crate::snapshot::SnapshotError) -> Self {
        ApiError::External(e.to_string())
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
