//! In-memory store for tests
//!
//! Mirrors the Postgres store's observable behavior closely enough for the
//! controller, reconciler, auth, and router tests to run without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{
    NewProject, ProjectRecord, ProjectStatus, RefreshTokenRecord, Store, StoreError, StoreResult,
    UserRecord,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, UserRecord>,
    tokens: HashMap<Uuid, RefreshTokenRecord>,
    projects: HashMap<Uuid, ProjectRecord>,
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a project directly, bypassing the creation flow. Test helper.
    pub fn put_project(&self, project: ProjectRecord) {
        self.tables.lock().projects.insert(project.id, project);
    }

    /// Read a project directly. Test helper.
    pub fn get_project(&self, id: Uuid) -> Option<ProjectRecord> {
        self.tables.lock().projects.get(&id).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_user(&self, email: &str, password_hash: &str) -> StoreResult<UserRecord> {
        let mut tables = self.tables.lock();
        if tables.users.values().any(|u| u.email == email) {
            return Err(StoreError::Conflict("email already registered".into()));
        }

        let user = UserRecord {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            created_at: Utc::now(),
            bucket: None,
            identity: None,
            credential_json: None,
        };
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn user_by_email(&self, email: &str) -> StoreResult<Option<UserRecord>> {
        Ok(self
            .tables
            .lock()
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn user_by_id(&self, id: Uuid) -> StoreResult<Option<UserRecord>> {
        Ok(self.tables.lock().users.get(&id).cloned())
    }

    async fn set_user_bucket(&self, id: Uuid, bucket: &str) -> StoreResult<()> {
        if let Some(user) = self.tables.lock().users.get_mut(&id) {
            user.bucket = Some(bucket.to_string());
        }
        Ok(())
    }

    async fn set_user_identity(&self, id: Uuid, identity: &str) -> StoreResult<()> {
        if let Some(user) = self.tables.lock().users.get_mut(&id) {
            user.identity = Some(identity.to_string());
        }
        Ok(())
    }

    async fn set_user_credential(&self, id: Uuid, credential_json: &str) -> StoreResult<()> {
        if let Some(user) = self.tables.lock().users.get_mut(&id) {
            user.credential_json = Some(credential_json.to_string());
        }
        Ok(())
    }

    async fn insert_refresh_token(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<RefreshTokenRecord> {
        let token = RefreshTokenRecord {
            id: Uuid::new_v4(),
            user_id,
            token_hash: token_hash.to_string(),
            expires_at,
            created_at: Utc::now(),
        };
        self.tables.lock().tokens.insert(token.id, token.clone());
        Ok(token)
    }

    async fn refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> StoreResult<Option<RefreshTokenRecord>> {
        Ok(self
            .tables
            .lock()
            .tokens
            .values()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn delete_refresh_token(&self, id: Uuid) -> StoreResult<()> {
        self.tables.lock().tokens.remove(&id);
        Ok(())
    }

    async fn insert_project(&self, new: &NewProject) -> StoreResult<ProjectRecord> {
        let now = Utc::now();
        let project = ProjectRecord {
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
        };
        self.tables.lock().projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn project_owned(&self, id: Uuid, user_id: Uuid) -> StoreResult<Option<ProjectRecord>> {
        Ok(self
            .tables
            .lock()
            .projects
            .get(&id)
            .filter(|p| p.user_id == user_id)
            .cloned())
    }

    async fn project_by_id(&self, id: Uuid) -> StoreResult<Option<ProjectRecord>> {
        Ok(self.tables.lock().projects.get(&id).cloned())
    }

    async fn projects_for_user(&self, user_id: Uuid) -> StoreResult<Vec<ProjectRecord>> {
        let mut projects: Vec<_> = self
            .tables
            .lock()
            .projects
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(projects)
    }

    async fn update_status(&self, id: Uuid, status: ProjectStatus) -> StoreResult<()> {
        if let Some(project) = self.tables.lock().projects.get_mut(&id) {
            project.status = status;
            project.last_active_at = Utc::now();
        }
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
        if let Some(project) = self.tables.lock().projects.get_mut(&id) {
            project.status = ProjectStatus::Running;
            project.container_id = Some(container_id.to_string());
            project.container_name = Some(container_name.to_string());
            project.volume_name = Some(volume_name.to_string());
            project.ssh_host_port = Some(ssh_host_port);
            project.last_active_at = Utc::now();
        }
        Ok(())
    }

    async fn record_snapshot(
        &self,
        id: Uuid,
        image_ref: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if let Some(project) = self.tables.lock().projects.get_mut(&id) {
            project.status = ProjectStatus::Stopped;
            project.snapshot_image = Some(image_ref.to_string());
            project.last_snapshot_at = Some(at);
            project.last_backup_at = Some(at);
            project.container_id = None;
            project.container_name = None;
            project.ssh_host_port = None;
            project.last_active_at = Utc::now();
        }
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
        if let Some(project) = self.tables.lock().projects.get_mut(&id) {
            project.status = ProjectStatus::Running;
            project.container_id = Some(container_id.to_string());
            project.container_name = Some(container_name.to_string());
            project.volume_name = Some(volume_name.to_string());
            project.ssh_host_port = Some(ssh_host_port);
            project.last_active_at = Utc::now();
        }
        Ok(())
    }

    async fn touch_connection(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(project) = self.tables.lock().projects.get_mut(&id) {
            project.last_connection_at = Some(at);
        }
        Ok(())
    }

    async fn delete_project(&self, id: Uuid) -> StoreResult<()> {
        self.tables.lock().projects.remove(&id);
        Ok(())
    }

    async fn stuck_projects(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<ProjectRecord>> {
        Ok(self
            .tables
            .lock()
            .projects
            .values()
            .filter(|p| p.status.is_transitional() && p.last_active_at < cutoff)
            .cloned()
            .collect())
    }

    async fn idle_projects(
        &self,
        cutoff: DateTime<Utc>,
        include_never_connected: bool,
    ) -> StoreResult<Vec<ProjectRecord>> {
        Ok(self
            .tables
            .lock()
            .projects
            .values()
            .filter(|p| p.status == ProjectStatus::Running)
            .filter(|p| match p.last_connection_at {
                Some(at) => at < cutoff,
                None => include_never_connected,
            })
            .cloned()
            .collect())
    }
}
