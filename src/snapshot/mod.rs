//! Snapshot & restore engine
//!
//! Captures a running sandbox to the image registry (after flushing the
//! workspace to object storage) and rebuilds containers on start, either
//! from the snapshot image with the surviving volume or from the base
//! image with a workspace pull on first boot. The engine depends only on
//! the runtime and registry adapter traits.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::docker::{container_name, ContainerRuntime, RuntimeError, SandboxSpec, WORKSPACE_MOUNT};
use crate::registry::{format_snapshot_tag, ImageRegistry, RegistryCredentials, RegistryError};

/// Graceful stop window before a snapshotted container is killed.
const STOP_TIMEOUT_SECS: i64 = 30;

/// Engine errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Result of a completed snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    /// Image reference for the fast restore path (`{repo}:latest`)
    pub image_ref: String,

    /// When the snapshot was taken
    pub snapshot_at: DateTime<Utc>,
}

/// Which restore path applies to a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestorePath {
    /// Rebuild from the snapshot image, reusing the existing volume
    Snapshot(String),

    /// Rebuild from the base image; the in-container init pulls the
    /// workspace from object storage on first boot
    Base,
}

/// Pure restore-path selection.
pub fn choose_restore(snapshot_image: Option<&str>) -> RestorePath {
    match snapshot_image {
        Some(image) => RestorePath::Snapshot(image.to_string()),
        None => RestorePath::Base,
    }
}

/// Snapshot engine
pub struct SnapshotEngine {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<dyn ImageRegistry>,

    /// Registry root for snapshot repositories
    registry_root: String,

    /// Service-account key file authenticating registry pushes and pulls
    credentials_path: String,
}

impl SnapshotEngine {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<dyn ImageRegistry>,
        registry_root: &str,
        credentials_path: &str,
    ) -> Self {
        Self {
            runtime,
            registry,
            registry_root: registry_root.to_string(),
            credentials_path: credentials_path.to_string(),
        }
    }

    fn repo_for(&self, project_id: Uuid) -> String {
        format!("{}/{}", self.registry_root, project_id)
    }

    async fn registry_credentials(&self) -> SnapshotResult<RegistryCredentials> {
        let key_json = tokio::fs::read_to_string(&self.credentials_path).await?;
        Ok(RegistryCredentials::json_key(key_json))
    }

    /// Snapshot a running sandbox.
    ///
    /// Flushes the workspace to the project's object-storage prefix, commits
    /// the container with a timestamp tag plus the `latest` alias, pushes
    /// both, then stops and removes the container. The volume is preserved.
    pub async fn snapshot(
        &self,
        project_id: Uuid,
        bucket: &str,
        storage_prefix: &str,
    ) -> SnapshotResult<SnapshotOutcome> {
        // Final workspace flush. A failed sync is logged, not fatal: the
        // image commit still captures the live filesystem.
        let flush = self
            .runtime
            .exec(
                project_id,
                vec![
                    "rclone".to_string(),
                    "sync".to_string(),
                    WORKSPACE_MOUNT.to_string(),
                    format!(":gcs:{}/{}", bucket, storage_prefix),
                    "--transfers=8".to_string(),
                    "--checksum".to_string(),
                    "--gcs-service-account-file=/tmp/gcs-key.json".to_string(),
                    "--gcs-bucket-policy-only".to_string(),
                ],
                "root",
            )
            .await?;
        if flush.exit_code != 0 {
            warn!(
                "Workspace flush for {} exited {}: {}",
                project_id, flush.exit_code, flush.output
            );
        }

        let snapshot_at = Utc::now();
        let tag = format_snapshot_tag(snapshot_at);
        let repo = self.repo_for(project_id);

        info!("Committing {} as {}:{}", project_id, repo, tag);
        let image_id = self
            .registry
            .commit(&container_name(project_id), &repo, &tag)
            .await?;
        self.registry.tag(&image_id, &repo, "latest").await?;

        let credentials = self.registry_credentials().await?;
        self.registry.push(&repo, &tag, &credentials).await?;
        self.registry.push(&repo, "latest", &credentials).await?;

        info!("Stopping and removing container for {}", project_id);
        self.runtime
            .stop_container(project_id, STOP_TIMEOUT_SECS)
            .await?;
        self.runtime.delete_container(project_id).await?;

        Ok(SnapshotOutcome {
            image_ref: format!("{}:latest", repo),
            snapshot_at,
        })
    }

    /// Fast restore: rebuild from the snapshot image, reusing the existing
    /// volume and network, publishing a fresh SSH port.
    pub async fn restore_from_snapshot(
        &self,
        project_id: Uuid,
        image_ref: &str,
        spec: &SandboxSpec,
    ) -> SnapshotResult<(String, u16)> {
        let credentials = self.registry_credentials().await?;
        self.registry.pull(image_ref, &credentials).await?;

        let spec = SandboxSpec {
            image: image_ref.to_string(),
            ..spec.clone()
        };
        let created = self.runtime.run_container(project_id, &spec).await?;
        Ok(created)
    }

    /// Fallback restore: rebuild from the base image on a fresh volume.
    /// The network may survive from the original creation.
    pub async fn restore_from_base(
        &self,
        project_id: Uuid,
        spec: &SandboxSpec,
    ) -> SnapshotResult<(String, u16)> {
        match self.runtime.create_network(project_id).await {
            Ok(_) | Err(RuntimeError::NetworkExists(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.runtime.create_volume(project_id).await?;

        let created = self.runtime.run_container(project_id, spec).await?;
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockRegistry, MockRuntime};

    fn spec() -> SandboxSpec {
        SandboxSpec {
            image: "agent-sandbox:latest".into(),
            bucket: "bucket".into(),
            storage_prefix: "p/workspace".into(),
            credential_json: "{}".into(),
            ssh_public_key: "ssh-ed25519 AAAA".into(),
        }
    }

    fn credentials_file() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "{\"type\":\"service_account\"}").unwrap();
        file
    }

    #[test]
    fn restore_path_prefers_snapshot_image() {
        assert_eq!(
            choose_restore(Some("registry/p:latest")),
            RestorePath::Snapshot("registry/p:latest".into())
        );
        assert_eq!(choose_restore(None), RestorePath::Base);
    }

    #[tokio::test]
    async fn snapshot_pushes_both_tags_and_removes_container() {
        let runtime = MockRuntime::shared();
        let registry = MockRegistry::shared();
        let credentials = credentials_file();
        let engine = SnapshotEngine::new(
            runtime.clone(),
            registry.clone(),
            "registry.test/sandboxes",
            credentials.path().to_str().unwrap(),
        );
        let id = Uuid::new_v4();

        let outcome = engine.snapshot(id, "bucket", "p/workspace").await.unwrap();

        assert_eq!(
            outcome.image_ref,
            format!("registry.test/sandboxes/{}:latest", id)
        );
        let pushes = registry.calls_matching("push:");
        assert_eq!(pushes.len(), 2);
        assert!(pushes.iter().any(|c| c.ends_with(":latest")));
        assert!(runtime.called("stop_container"));
        assert!(runtime.called("delete_container"));
        // The volume must survive the snapshot
        assert!(!runtime.called("delete_volume"));
    }

    #[tokio::test]
    async fn failed_workspace_flush_does_not_abort_snapshot() {
        let runtime = MockRuntime::shared();
        runtime.set_exec_exit_code(1);
        let registry = MockRegistry::shared();
        let credentials = credentials_file();
        let engine = SnapshotEngine::new(
            runtime.clone(),
            registry.clone(),
            "registry.test/sandboxes",
            credentials.path().to_str().unwrap(),
        );

        let outcome = engine
            .snapshot(Uuid::new_v4(), "bucket", "p/workspace")
            .await
            .unwrap();
        assert!(outcome.image_ref.ends_with(":latest"));
    }

    #[tokio::test]
    async fn base_restore_tolerates_existing_network() {
        let runtime = MockRuntime::shared();
        runtime.set_network_exists(true);
        let registry = MockRegistry::shared();
        let credentials = credentials_file();
        let engine = SnapshotEngine::new(
            runtime.clone(),
            registry.clone(),
            "registry.test/sandboxes",
            credentials.path().to_str().unwrap(),
        );

        let (container_id, port) = engine
            .restore_from_base(Uuid::new_v4(), &spec())
            .await
            .unwrap();
        assert!(!container_id.is_empty());
        assert!(port >= 30000);
        assert!(runtime.called("create_volume"));
    }

    #[tokio::test]
    async fn snapshot_restore_skips_pull_when_local() {
        let runtime = MockRuntime::shared();
        let registry = MockRegistry::shared();
        registry.add_local_image("registry.test/sandboxes/p:latest");
        let credentials = credentials_file();
        let engine = SnapshotEngine::new(
            runtime.clone(),
            registry.clone(),
            "registry.test/sandboxes",
            credentials.path().to_str().unwrap(),
        );

        engine
            .restore_from_snapshot(Uuid::new_v4(), "registry.test/sandboxes/p:latest", &spec())
            .await
            .unwrap();
        assert!(registry.called("pull_skipped:registry.test/sandboxes/p:latest"));
    }
}
