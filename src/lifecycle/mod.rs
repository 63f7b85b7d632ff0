//! Lifecycle controller
//!
//! State machine over persisted projects, composing the runtime, IAM, and
//! registry adapters with the snapshot engine and tenant provisioner:
//!
//! ```text
//!             create                       start
//!   (none) ──────────▶ creating ──┬──▶ running ──┬──▶ snapshotting ──▶ stopped
//!                                 │               │                       │
//!                                 │               └──▶ error              │
//!                                 └──▶ error                              ▼
//!                                                                      restoring ──▶ running | error
//! ```
//!
//! Operations are exclusive per project; every fetch is scoped to the
//! calling owner so foreign projects are indistinguishable from missing
//! ones.

mod keys;
mod locks;

pub use keys::generate_ssh_keypair;
pub use locks::ProjectLocks;

use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Configuration;
use crate::db::{NewProject, ProjectRecord, ProjectStatus, Store, UserRecord};
use crate::docker::{container_name, volume_name, ContainerRuntime, SandboxSpec};
use crate::error::{ApiError, ApiResult};
use crate::cloud::ObjectStorageIam;
use crate::registry::ImageRegistry;
use crate::snapshot::{choose_restore, RestorePath, SnapshotEngine};
use crate::tenant::{TenantError, TenantProvisioner};

/// Lifecycle controller
pub struct LifecycleController {
    store: Arc<dyn Store>,
    runtime: Arc<dyn ContainerRuntime>,
    storage: Arc<dyn ObjectStorageIam>,
    registry: Arc<dyn ImageRegistry>,
    snapshots: SnapshotEngine,
    provisioner: TenantProvisioner,
    locks: ProjectLocks,
    config: Arc<Configuration>,
}

impl LifecycleController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        runtime: Arc<dyn ContainerRuntime>,
        storage: Arc<dyn ObjectStorageIam>,
        registry: Arc<dyn ImageRegistry>,
        snapshots: SnapshotEngine,
        provisioner: TenantProvisioner,
        config: Arc<Configuration>,
    ) -> Self {
        Self {
            store,
            runtime,
            storage,
            registry,
            snapshots,
            provisioner,
            locks: ProjectLocks::new(),
            config,
        }
    }

    /// Fetch a project scoped to its owner. Absence and foreign ownership
    /// are both surfaced as NotFound.
    async fn owned_project(&self, project_id: Uuid, user_id: Uuid) -> ApiResult<ProjectRecord> {
        self.store
            .project_owned(project_id, user_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Project not found".into()))
    }

    async fn owner(&self, user_id: Uuid) -> ApiResult<UserRecord> {
        self.store
            .user_by_id(user_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("User not found".into()))
    }

    /// List the caller's projects, newest first.
    pub async fn list(&self, user_id: Uuid) -> ApiResult<Vec<ProjectRecord>> {
        Ok(self.store.projects_for_user(user_id).await?)
    }

    /// Fetch one project owned by the caller.
    pub async fn get(&self, project_id: Uuid, user_id: Uuid) -> ApiResult<ProjectRecord> {
        self.owned_project(project_id, user_id).await
    }

    /// Create a project: persist the record, ensure tenant material, and
    /// launch the sandbox container. Failures leave the record in `error`
    /// with per-project Docker resources cleaned up; tenant-level identity
    /// and bucket are never rolled back; they are reused across projects.
    pub async fn create(&self, user_id: Uuid, name: &str) -> ApiResult<ProjectRecord> {
        let project_id = Uuid::new_v4();
        info!("Creating project {} '{}' for user {}", project_id, name, user_id);

        let (ssh_public_key, ssh_private_key) = generate_ssh_keypair()?;

        let new = NewProject {
            id: project_id,
            user_id,
            name: name.to_string(),
            ssh_public_key: ssh_public_key.clone(),
            ssh_private_key,
            storage_prefix: format!("{}/workspace", project_id),
        };
        self.store.insert_project(&new).await?;
        info!("[{}] Record persisted (status=creating)", project_id);

        match self.launch(&new, &ssh_public_key).await {
            Ok((container_id, ssh_port)) => {
                self.store
                    .attach_container(
                        project_id,
                        &container_id,
                        &container_name(project_id),
                        &volume_name(project_id),
                        ssh_port as i32,
                    )
                    .await?;
                info!("[{}] Project ready (status=running)", project_id);
                self.owned_project(project_id, user_id).await
            }
            Err(e) => {
                error!("[{}] Create failed: {}", project_id, e);
                if let Err(cleanup) = self.runtime.cleanup_project_resources(project_id).await {
                    warn!("[{}] Docker cleanup error (ignored): {}", project_id, cleanup);
                }
                self.store
                    .update_status(project_id, ProjectStatus::Error)
                    .await?;
                Err(e)
            }
        }
    }

    /// Tenant material, container launch, and proxy attach for `create`.
    async fn launch(&self, new: &NewProject, ssh_public_key: &str) -> ApiResult<(String, u16)> {
        let user = self.owner(new.user_id).await?;
        let material = self.provisioner.ensure_tenant(&user).await.map_err(|e| match e {
            TenantError::Store(e) => ApiError::from(e),
            other => ApiError::External(other.to_string()),
        })?;

        let spec = SandboxSpec {
            image: self.config.sandbox.base_image.clone(),
            bucket: material.bucket,
            storage_prefix: new.storage_prefix.clone(),
            credential_json: material.credential_json,
            ssh_public_key: ssh_public_key.to_string(),
        };

        let (container_id, ssh_port) = self.runtime.create_container(new.id, &spec).await?;
        info!(
            "[{}] Container created: {} (SSH port {})",
            new.id,
            &container_id[..container_id.len().min(12)],
            ssh_port
        );

        self.runtime.connect_proxy_to_network(new.id).await?;
        Ok((container_id, ssh_port))
    }

    /// Stop a project: snapshot it, then tear the container down. The
    /// volume is preserved for the fast restore path.
    pub async fn stop(&self, project_id: Uuid, user_id: Uuid) -> ApiResult<ProjectRecord> {
        let _guard = self.locks.lock(project_id).await;

        let project = self.owned_project(project_id, user_id).await?;
        if project.status != ProjectStatus::Running {
            return Err(ApiError::InvalidState(format!(
                "Project is not running (status={})",
                project.status
            )));
        }

        self.snapshot_locked(&project).await?;
        self.owned_project(project_id, user_id).await
    }

    /// Snapshot a running project. Identical to [`stop`].
    pub async fn snapshot(&self, project_id: Uuid, user_id: Uuid) -> ApiResult<ProjectRecord> {
        self.stop(project_id, user_id).await
    }

    /// Snapshot transition shared by `stop` and the reconciler. The
    /// caller holds the project lock and has verified `running`.
    async fn snapshot_locked(&self, project: &ProjectRecord) -> ApiResult<()> {
        let owner = self.owner(project.user_id).await?;
        let bucket = owner
            .bucket
            .ok_or_else(|| ApiError::External("Owner has no tenant bucket".into()))?;

        info!("[{}] Snapshotting...", project.id);
        self.store
            .update_status(project.id, ProjectStatus::Snapshotting)
            .await?;

        match self
            .snapshots
            .snapshot(project.id, &bucket, &project.storage_prefix)
            .await
        {
            Ok(outcome) => {
                self.store
                    .record_snapshot(project.id, &outcome.image_ref, outcome.snapshot_at)
                    .await?;
                info!("[{}] Snapshot complete, project stopped", project.id);
                Ok(())
            }
            Err(e) => {
                error!("[{}] Snapshot failed: {}", project.id, e);
                self.store
                    .update_status(project.id, ProjectStatus::Error)
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Start a stopped project, restoring from the snapshot image when one
    /// exists and from the base image otherwise.
    pub async fn start(&self, project_id: Uuid, user_id: Uuid) -> ApiResult<ProjectRecord> {
        let _guard = self.locks.lock(project_id).await;

        let project = self.owned_project(project_id, user_id).await?;
        if project.status != ProjectStatus::Stopped {
            return Err(ApiError::InvalidState(format!(
                "Project is not stopped (status={})",
                project.status
            )));
        }

        let owner = self.owner(user_id).await?;
        let bucket = owner
            .bucket
            .ok_or_else(|| ApiError::External("Owner has no tenant bucket".into()))?;
        let credential_json = owner
            .credential_json
            .ok_or_else(|| ApiError::External("Owner has no tenant credential".into()))?;

        info!("[{}] Starting project (restoring)...", project_id);
        self.store
            .update_status(project_id, ProjectStatus::Restoring)
            .await?;

        let spec = SandboxSpec {
            image: self.config.sandbox.base_image.clone(),
            bucket,
            storage_prefix: project.storage_prefix.clone(),
            credential_json,
            ssh_public_key: project.ssh_public_key.clone(),
        };

        let restored = match choose_restore(project.snapshot_image.as_deref()) {
            RestorePath::Snapshot(image_ref) => {
                info!("[{}] Restoring from snapshot {}", project_id, image_ref);
                self.snapshots
                    .restore_from_snapshot(project_id, &image_ref, &spec)
                    .await
            }
            RestorePath::Base => {
                info!("[{}] Restoring from base image {}", project_id, spec.image);
                self.snapshots.restore_from_base(project_id, &spec).await
            }
        };

        match restored {
            Ok((container_id, ssh_port)) => {
                if let Err(e) = self.runtime.connect_proxy_to_network(project_id).await {
                    error!("[{}] Proxy reattach failed: {}", project_id, e);
                    self.store
                        .update_status(project_id, ProjectStatus::Error)
                        .await?;
                    return Err(e.into());
                }

                self.store
                    .record_restore(
                        project_id,
                        &container_id,
                        &container_name(project_id),
                        &volume_name(project_id),
                        ssh_port as i32,
                    )
                    .await?;
                info!("[{}] Project started (status=running)", project_id);
                self.owned_project(project_id, user_id).await
            }
            Err(e) => {
                error!("[{}] Restore failed: {}", project_id, e);
                self.store
                    .update_status(project_id, ProjectStatus::Error)
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Delete a project. Every external teardown step is best-effort; the
    /// row is removed regardless so a retry with the same id terminates.
    pub async fn delete(&self, project_id: Uuid, user_id: Uuid) -> ApiResult<()> {
        let _guard = self.locks.lock(project_id).await;

        let project = self.owned_project(project_id, user_id).await?;
        let owner = self.owner(user_id).await?;
        info!("[{}] Deleting project...", project_id);

        if let Err(e) = self.runtime.disconnect_proxy_from_network(project_id).await {
            warn!("[{}] Proxy disconnect error (ignored): {}", project_id, e);
        }
        if let Err(e) = self.runtime.cleanup_project_resources(project_id).await {
            warn!("[{}] Docker cleanup error (ignored): {}", project_id, e);
        }

        if let Some(bucket) = &owner.bucket {
            let prefix = format!("{}/", project_id);
            if let Err(e) = self.storage.delete_prefix(bucket, &prefix).await {
                warn!("[{}] Workspace prefix delete error (ignored): {}", project_id, e);
            }
        }

        if let Err(e) = self.registry.delete_all_versions(project_id).await {
            warn!("[{}] Registry cleanup error (ignored): {}", project_id, e);
        }

        self.store.delete_project(project.id).await?;
        info!("[{}] Project deleted", project_id);
        Ok(())
    }

    /// Reconciler entry point: snapshot a running project without an owner
    /// scope. Projects that left `running` before the lock was acquired
    /// are skipped.
    pub async fn auto_snapshot(&self, project_id: Uuid) -> ApiResult<()> {
        let _guard = self.locks.lock(project_id).await;

        let Some(project) = self.store.project_by_id(project_id).await? else {
            return Ok(());
        };
        if project.status != ProjectStatus::Running {
            return Ok(());
        }

        self.snapshot_locked(&project).await
    }
}
