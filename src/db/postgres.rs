//! Postgres store implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use super::{
    NewProject, ProjectRecord, ProjectStatus, RefreshTokenRecord, Store, StoreError, StoreResult,
    UserRecord,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id UUID PRIMARY KEY,
    email TEXT UNIQUE NOT NULL,
    password_hash TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    bucket TEXT,
    identity TEXT,
    credential_json TEXT
);

CREATE TABLE IF NOT EXISTS refresh_tokens (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    token_hash TEXT UNIQUE NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS projects (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    container_id TEXT,
    container_name TEXT,
    volume_name TEXT,
    ssh_host_port INTEGER,
    ssh_public_key TEXT NOT NULL,
    ssh_private_key TEXT NOT NULL,
    storage_prefix TEXT NOT NULL,
    snapshot_image TEXT,
    last_snapshot_at TIMESTAMPTZ,
    snapshot_size_bytes BIGINT,
    created_at TIMESTAMPTZ NOT NULL,
    last_active_at TIMESTAMPTZ NOT NULL,
    last_backup_at TIMESTAMPTZ,
    last_connection_at TIMESTAMPTZ
);
"#;

/// Postgres-backed store
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to the database.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        info!("Connected to database");
        Ok(Self { pool })
    }

    /// Create tables if they do not exist. Production deployments run
    /// migrations out of band; this mirrors the dev bootstrap.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

fn user_from_row(row: &PgRow) -> Result<UserRecord, sqlx::Error> {
    Ok(UserRecord {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        created_at: row.try_get("created_at")?,
        bucket: row.try_get("bucket")?,
        identity: row.try_get("identity")?,
        credential_json: row.try_get("credential_json")?,
    })
}

fn token_from_row(row: &PgRow) -> Result<RefreshTokenRecord, sqlx::Error> {
    Ok(RefreshTokenRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        token_hash: row.try_get("token_hash")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn project_from_row(row: &PgRow) -> Result<ProjectRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = ProjectStatus::parse(&status).map_err(|e| sqlx::Error::ColumnDecode {
        index: "status".into(),
        source: Box::new(e),
    })?;

    Ok(ProjectRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        status,
        container_id: row.try_get("container_id")?,
        container_name: row.try_get("container_name")?,
        volume_name: row.try_get("volume_name")?,
        ssh_host_port: row.try_get("ssh_host_port")?,
        ssh_public_key: row.try_get("ssh_public_key")?,
        ssh_private_key: row.try_get("ssh_private_key")?,
        storage_prefix: row.try_get("storage_prefix")?,
        snapshot_image: row.try_get("snapshot_image")?,
        last_snapshot_at: row.try_get("last_snapshot_at")?,
        snapshot_size_bytes: row.try_get("snapshot_size_bytes")?,
        created_at: row.try_get("created_at")?,
        last_active_at: row.try_get("last_active_at")?,
        last_backup_at: row.try_get("last_backup_at")?,
        last_connection_at: row.try_get("last_connection_at")?,
    })
}

const PROJECT_COLUMNS: &str = "id, user_id, name, status, container_id, container_name, \
     volume_name, ssh_host_port, ssh_public_key, ssh_private_key, storage_prefix, \
     snapshot_image, last_snapshot_at, snapshot_size_bytes, created_at, last_active_at, \
     last_backup_at, last_connection_at";

#[async_trait]
impl Store for PgStore {
    async fn create_user(&self, email: &str, password_hash: &str) -> StoreResult<UserRecord> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO users (id, email, password_hash, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(email)
        .bind(password_hash)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(UserRecord {
                id,
                email: email.to_string(),
                password_hash: password_hash.to_string(),
                created_at: now,
                bucket: None,
                identity: None,
                credential_json: None,
            }),
            Err(e) => match StoreError::from(e) {
                StoreError::Conflict(_) => {
                    Err(StoreError::Conflict("email already registered".into()))
                }
                other => Err(other),
            },
        }
    }

    async fn user_by_email(&self, email: &str) -> StoreResult<Option<UserRecord>> {
        let row = sqlx::query(
            "SELECT id, email, password_hash, created_at, bucket, identity, credential_json \
             FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(user_from_row).transpose().map_err(Into::into)
    }

    async fn user_by_id(&self, id: Uuid) -> StoreResult<Option<UserRecord>> {
        let row = sqlx::query(
            "SELECT id, email, password_hash, created_at, bucket, identity, credential_json \
             FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(user_from_row).transpose().map_err(Into::into)
    }

    async fn set_user_bucket(&self, id: Uuid, bucket: &str) -> StoreResult<()> {
        sqlx::query("UPDATE users SET bucket = $2 WHERE id = $1")
            .bind(id)
            .bind(bucket)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_user_identity(&self, id: Uuid, identity: &str) -> StoreResult<()> {
        sqlx::query("UPDATE users SET identity = $2 WHERE id = $1")
            .bind(id)
            .bind(identity)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_user_credential(&self, id: Uuid, credential_json: &str) -> StoreResult<()> {
        sqlx::query("UPDATE users SET credential_json = $2 WHERE id = $1")
            .bind(id)
            .bind(credential_json)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_refresh_token(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<RefreshTokenRecord> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id)
        .bind(user_id)
        .bind(token_hash)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(RefreshTokenRecord {
            id,
            user_id,
            token_hash: token_hash.to_string(),
            expires_at,
            created_at: now,
        })
    }

    async fn refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> StoreResult<Option<RefreshTokenRecord>> {
        let row = sqlx::query(
            "SELECT id, user_id, token_hash, expires_at, created_at \
             FROM refresh_tokens WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(token_from_row).transpose().map_err(Into::into)
    }

    async fn delete_refresh_token(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM refresh_tokens WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_project(&self, new: &NewProject) -> StoreResult<ProjectRecord> {
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO projects (id, user_id, name, status, ssh_public_key, ssh_private_key, \
             storage_prefix, created_at, last_active_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)",
        )
        .bind(new.id)
        .bind(new.user_id)
        .bind(&new.name)
        .bind(ProjectStatus::Creating.as_str())
        .bind(&new.ssh_public_key)
        .bind(&new.ssh_private_key)
        .bind(&new.storage_prefix)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(ProjectRecord {
            id: new.id,
            user_id: new.user_id,
            name: new.name.clone(),
            status: ProjectStatus::Creating,
            container_id: None,
            container_name: None,
            volume_name: None,
            ssh_host_port: None,
            ssh_public_key: new.ssh_public_key.clone(),
            ssh_private_key: new.ssh_private_key.clone(),
            storage_prefix: new.storage_prefix.clone(),
            snapshot_image: None,
            last_snapshot_at: None,
            snapshot_size_bytes: None,
            created_at: now,
            last_active_at: now,
            last_backup_at: None,
            last_connection_at: None,
        })
    }

    async fn project_owned(&self, id: Uuid, user_id: Uuid) -> StoreResult<Option<ProjectRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1 AND user_id = $2"
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(project_from_row).transpose().map_err(Into::into)
    }

    async fn project_by_id(&self, id: Uuid) -> StoreResult<Option<ProjectRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(project_from_row).transpose().map_err(Into::into)
    }

    async fn projects_for_user(&self, user_id: Uuid) -> StoreResult<Vec<ProjectRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(project_from_row).collect::<Result<_, _>>().map_err(Into::into)
    }

    async fn update_status(&self, id: Uuid, status: ProjectStatus) -> StoreResult<()> {
        sqlx::query("UPDATE projects SET status = $2, last_active_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn attach_container(
        &self,
        id: Uuid,
        container_id: &str,
        container_name: &str,
        volume_name: &str,
        ssh_host_port: i32,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE projects SET status = $2, container_id = $3, container_name = $4, \
             volume_name = $5, ssh_host_port = $6, last_active_at = $7 WHERE id = $1",
        )
        .bind(id)
        .bind(ProjectStatus::Running.as_str())
        .bind(container_id)
        .bind(container_name)
        .bind(volume_name)
        .bind(ssh_host_port)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_snapshot(
        &self,
        id: Uuid,
        image_ref: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE projects SET status = $2, snapshot_image = $3, last_snapshot_at = $4, \
             last_backup_at = $4, container_id = NULL, container_name = NULL, \
             ssh_host_port = NULL, last_active_at = $5 WHERE id = $1",
        )
        .bind(id)
        .bind(ProjectStatus::Stopped.as_str())
        .bind(image_ref)
        .bind(at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_restore(
        &self,
        id: Uuid,
        container_id: &str,
        container_name: &str,
        volume_name: &str,
        ssh_host_port: i32,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE projects SET status = $2, container_id = $3, container_name = $4, \
             volume_name = $5, ssh_host_port = $6, last_active_at = $7 WHERE id = $1",
        )
        .bind(id)
        .bind(ProjectStatus::Running.as_str())
        .bind(container_id)
        .bind(container_name)
        .bind(volume_name)
        .bind(ssh_host_port)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_connection(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE projects SET last_connection_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_project(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stuck_projects(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<ProjectRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects \
             WHERE status IN ('creating', 'snapshotting', 'restoring') AND last_active_at < $1"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(project_from_row).collect::<Result<_, _>>().map_err(Into::into)
    }

    async fn idle_projects(
        &self,
        cutoff: DateTime<Utc>,
        include_never_connected: bool,
    ) -> StoreResult<Vec<ProjectRecord>> {
        let query = if include_never_connected {
            format!(
                "SELECT {PROJECT_COLUMNS} FROM projects WHERE status = 'running' \
                 AND (last_connection_at < $1 OR last_connection_at IS NULL)"
            )
        } else {
            format!(
                "SELECT {PROJECT_COLUMNS} FROM projects WHERE status = 'running' \
                 AND last_connection_at < $1"
            )
        };

        let rows = sqlx::query(&query).bind(cutoff).fetch_all(&self.pool).await?;

        rows.iter().map(project_from_row).collect::<Result<_, _>>().map_err(Into::into)
    }
}
