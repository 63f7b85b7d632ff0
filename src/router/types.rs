//! Request/response wire types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Configuration;
use crate::db::{ProjectRecord, ProjectStatus};

// --- Auth ---

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

// --- Projects ---

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ProjectSummary {
    pub id: Uuid,
    pub name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl From<&ProjectRecord> for ProjectSummary {
    fn from(project: &ProjectRecord) -> Self {
        Self {
            id: project.id,
            name: project.name.clone(),
            status: project.status.to_string(),
            created_at: project.created_at,
            last_active_at: project.last_active_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProjectDetail {
    pub id: Uuid,
    pub name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub terminal_url: Option<String>,
    pub ssh_host: Option<String>,
    pub ssh_port: Option<i32>,
    pub ssh_user: String,
    pub ssh_private_key: Option<String>,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub last_snapshot_at: Option<DateTime<Utc>>,
}

impl ProjectDetail {
    /// Terminal and SSH endpoints are only advertised while the sandbox
    /// is actually running.
    pub fn from_record(project: &ProjectRecord, config: &Configuration) -> Self {
        let running = project.status == ProjectStatus::Running;

        Self {
            id: project.id,
            name: project.name.clone(),
            status: project.status.to_string(),
            created_at: project.created_at,
            last_active_at: project.last_active_at,
            terminal_url: running.then(|| config.terminal_url(project.id)),
            ssh_host: running.then(|| config.network.host_ip.clone()),
            ssh_port: if running { project.ssh_host_port } else { None },
            ssh_user: "agent".to_string(),
            ssh_private_key: running.then(|| project.ssh_private_key.clone()),
            last_backup_at: project.last_backup_at,
            last_snapshot_at: project.last_snapshot_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupStatusResponse {
    pub last_backup_at: Option<DateTime<Utc>>,
    pub snapshot_image: Option<String>,
    pub last_snapshot_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub status: String,
}

// --- Internal ---

#[derive(Debug, Deserialize)]
pub struct InternalValidateRequest {
    pub token: String,
    pub project_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InternalValidateResponse {
    pub user_id: String,
}
