//! State persistence module
//!
//! Postgres-backed stores for users, refresh tokens, and projects, behind
//! a narrow [`Store`] trait so the controller, reconciler, and auth
//! verifier can run against an in-memory implementation in tests.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Database errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".into()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict("unique constraint violated".into())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Project lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectStatus {
    Creating,
    Running,
    Snapshotting,
    Stopped,
    Restoring,
    Error,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Creating => "creating",
            ProjectStatus::Running => "running",
            ProjectStatus::Snapshotting => "snapshotting",
            ProjectStatus::Stopped => "stopped",
            ProjectStatus::Restoring => "restoring",
            ProjectStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self, UnknownStatus> {
        match s {
            "creating" => Ok(ProjectStatus::Creating),
            "running" => Ok(ProjectStatus::Running),
            "snapshotting" => Ok(ProjectStatus::Snapshotting),
            "stopped" => Ok(ProjectStatus::Stopped),
            "restoring" => Ok(ProjectStatus::Restoring),
            "error" => Ok(ProjectStatus::Error),
            other => Err(UnknownStatus(other.to_string())),
        }
    }

    /// A live status implies a container handle exists.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ProjectStatus::Running | ProjectStatus::Snapshotting | ProjectStatus::Restoring
        )
    }

    /// Transitional statuses are recovered by the reconciler after a crash.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            ProjectStatus::Creating | ProjectStatus::Snapshotting | ProjectStatus::Restoring
        )
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown project status: {0}")]
pub struct UnknownStatus(pub String);

/// User record
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,

    // Tenant material, set lazily by the provisioner
    pub bucket: Option<String>,
    pub identity: Option<String>,
    pub credential_json: Option<String>,
}

/// Refresh token record. Only the digest of the opaque token is stored.
#[derive(Debug, Clone)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Project record
#[derive(Debug, Clone)]
pub struct ProjectRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub status: ProjectStatus,

    // Container runtime
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub volume_name: Option<String>,
    pub ssh_host_port: Option<i32>,

    // SSH material
    pub ssh_public_key: String,
    pub ssh_private_key: String,

    // Workspace prefix within the owner's bucket; immutable after creation
    pub storage_prefix: String,

    // Snapshot
    pub snapshot_image: Option<String>,
    pub last_snapshot_at: Option<DateTime<Utc>>,
    pub snapshot_size_bytes: Option<i64>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub last_connection_at: Option<DateTime<Utc>>,
}

/// Fields required to insert a new project in `creating` status.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub ssh_public_key: String,
    pub ssh_private_key: String,
    pub storage_prefix: String,
}

/// Persistence operations used by the core.
///
/// Every update is a narrow, single-purpose write so that lifecycle steps
/// can commit independently (the provisioner and controller rely on this
/// for crash-safe retries).
#[async_trait]
pub trait Store: Send + Sync {
    // Users
    async fn create_user(&self, email: &str, password_hash: &str) -> StoreResult<UserRecord>;
    async fn user_by_email(&self, email: &str) -> StoreResult<Option<UserRecord>>;
    async fn user_by_id(&self, id: Uuid) -> StoreResult<Option<UserRecord>>;
    async fn set_user_bucket(&self, id: Uuid, bucket: &str) -> StoreResult<()>;
    async fn set_user_identity(&self, id: Uuid, identity: &str) -> StoreResult<()>;
    async fn set_user_credential(&self, id: Uuid, credential_json: &str) -> StoreResult<()>;

    // Refresh tokens
    async fn insert_refresh_token(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<RefreshTokenRecord>;
    async fn refresh_token_by_hash(&self, token_hash: &str)
        -> StoreResult<Option<RefreshTokenRecord>>;
    async fn delete_refresh_token(&self, id: Uuid) -> StoreResult<()>;

    // Projects
    async fn insert_project(&self, new: &NewProject) -> StoreResult<ProjectRecord>;
    async fn project_owned(&self, id: Uuid, user_id: Uuid) -> StoreResult<Option<ProjectRecord>>;
    async fn project_by_id(&self, id: Uuid) -> StoreResult<Option<ProjectRecord>>;
    async fn projects_for_user(&self, user_id: Uuid) -> StoreResult<Vec<ProjectRecord>>;

    /// Set the status. Also refreshes `last_active_at` so the reconciler's
    /// stuck detection measures time spent in the new status.
    async fn update_status(&self, id: Uuid, status: ProjectStatus) -> StoreResult<()>;

    /// Record a freshly created container and mark the project running.
    async fn attach_container(
        &self,
        id: Uuid,
        container_id: &str,
        container_name: &str,
        volume_name: &str,
        ssh_host_port: i32,
    ) -> StoreResult<()>;

    /// Record a completed snapshot and mark the project stopped. The
    /// container handle and host port are cleared; the volume survives.
    async fn record_snapshot(
        &self,
        id: Uuid,
        image_ref: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Record a completed restore and mark the project running.
    async fn record_restore(
        &self,
        id: Uuid,
        container_id: &str,
        container_name: &str,
        volume_name: &str,
        ssh_host_port: i32,
    ) -> StoreResult<()>;

    /// Update `last_connection_at` (terminal session authenticated).
    async fn touch_connection(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;

    async fn delete_project(&self, id: Uuid) -> StoreResult<()>;

    /// Projects in a transitional status whose `last_active_at` is strictly
    /// older than `cutoff`.
    async fn stuck_projects(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<ProjectRecord>>;

    /// Running projects whose `last_connection_at` is strictly older than
    /// `cutoff`; when `include_never_connected`, NULL counts as idle.
    async fn idle_projects(
        &self,
        cutoff: DateTime<Utc>,
        include_never_connected: bool,
    ) -> StoreResult<Vec<ProjectRecord>>;
}
