//! HTTP router module
//!
//! REST surface for auth, project lifecycle, and the internal validate
//! endpoint the terminal gateway calls.

mod handlers;
mod middleware;
mod types;

pub use middleware::auth::AuthUser;
pub use types::*;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::auth::AuthVerifier;
use crate::config::Configuration;
use crate::lifecycle::LifecycleController;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Lifecycle controller
    pub controller: Arc<LifecycleController>,

    /// Auth verifier
    pub auth: Arc<AuthVerifier>,

    /// Global configuration
    pub config: Arc<Configuration>,
}

/// Build the HTTP router with all routes
pub fn build_router(state: AppState) -> Router {
    // Internal routes are guarded by the shared secret; without it they
    // are indistinguishable from non-existent paths
    let internal_routes = Router::new()
        .route("/validate", post(handlers::internal::validate))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::internal::require_internal_secret,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .nest("/internal", internal_routes)
        .nest("/projects", project_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Routes for project operations
fn project_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::projects::list_projects))
        .route("/", post(handlers::projects::create_project))
        .route("/:project_id", get(handlers::projects::get_project))
        .route("/:project_id", delete(handlers::projects::delete_project))
        .route("/:project_id/start", post(handlers::projects::start_project))
        .route("/:project_id/stop", post(handlers::projects::stop_project))
        .route("/:project_id/snapshot", post(handlers::projects::snapshot_project))
        .route("/:project_id/restore", post(handlers::projects::restore_project))
        .route(
            "/:project_id/backup-status",
            get(handlers::projects::backup_status),
        )
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
