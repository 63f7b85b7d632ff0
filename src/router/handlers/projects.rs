//! Project lifecycle routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use super::super::{
    AppState, AuthUser, BackupStatusResponse, CreateProjectRequest, DeleteResponse,
    ProjectDetail, ProjectSummary,
};
use crate::error::ApiResult;

pub async fn list_projects(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> ApiResult<Json<Vec<ProjectSummary>>> {
    let projects = state.controller.list(user_id).await?;
    Ok(Json(projects.iter().map(ProjectSummary::from).collect()))
}

pub async fn create_project(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<CreateProjectRequest>,
) -> ApiResult<(StatusCode, Json<ProjectDetail>)> {
    let project = state.controller.create(user_id, &request.name).await?;
    Ok((
        StatusCode::CREATED,
        Json(ProjectDetail::from_record(&project, &state.config)),
    ))
}

pub async fn get_project(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<ProjectDetail>> {
    let project = state.controller.get(project_id, user_id).await?;
    Ok(Json(ProjectDetail::from_record(&project, &state.config)))
}

pub async fn start_project(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<ProjectDetail>> {
    let project = state.controller.start(project_id, user_id).await?;
    Ok(Json(ProjectDetail::from_record(&project, &state.config)))
}

pub async fn stop_project(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<ProjectDetail>> {
    let project = state.controller.stop(project_id, user_id).await?;
    Ok(Json(ProjectDetail::from_record(&project, &state.config)))
}

pub async fn snapshot_project(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<ProjectDetail>> {
    let project = state.controller.snapshot(project_id, user_id).await?;
    Ok(Json(ProjectDetail::from_record(&project, &state.config)))
}

pub async fn restore_project(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<ProjectDetail>> {
    let project = state.controller.start(project_id, user_id).await?;
    Ok(Json(ProjectDetail::from_record(&project, &state.config)))
}

pub async fn delete_project(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<DeleteResponse>> {
    state.controller.delete(project_id, user_id).await?;
    Ok(Json(DeleteResponse {
        status: "deleted".to_string(),
    }))
}

pub async fn backup_status(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<BackupStatusResponse>> {
    let project = state.controller.get(project_id, user_id).await?;
    Ok(Json(BackupStatusResponse {
        last_backup_at: project.last_backup_at,
        snapshot_image: project.snapshot_image,
        last_snapshot_at: project.last_snapshot_at,
    }))
}
