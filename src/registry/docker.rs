//! Docker daemon + registry HTTP API implementation

use std::time::Duration;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::Config;
use bollard::image::{CommitContainerOptions, CreateImageOptions, PushImageOptions, TagImageOptions};
use bollard::Docker;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    parse_snapshot_tag, ImageRegistry, RegistryCredentials, RegistryError, RegistryResult,
    SnapshotVersion,
};

const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Registry adapter backed by the local Docker daemon and the remote
/// registry's HTTP API.
pub struct DockerImageRegistry {
    docker: Docker,
    http: Client,

    /// Registry root, e.g. `europe-west1-docker.pkg.dev/{project}/sandboxes`
    registry_root: String,

    /// Path to the service-account key authenticating registry HTTP calls
    credentials_path: String,
}

impl DockerImageRegistry {
    pub fn new(
        docker: Docker,
        registry_root: &str,
        credentials_path: &str,
    ) -> RegistryResult<Self> {
        let http = Client::builder().timeout(Duration::from_secs(60)).build()?;

        Ok(Self {
            docker,
            http,
            registry_root: registry_root.to_string(),
            credentials_path: credentials_path.to_string(),
        })
    }

    /// Repository for a project's snapshots.
    pub fn repo_for(&self, project_id: Uuid) -> String {
        format!("{}/{}", self.registry_root, project_id)
    }

    /// Split the registry root into `(host, repository_prefix)`.
    fn registry_host_and_path(&self) -> (&str, &str) {
        match self.registry_root.split_once('/') {
            Some((host, path)) => (host, path),
            None => (self.registry_root.as_str(), ""),
        }
    }

    fn http_credentials(&self) -> RegistryResult<RegistryCredentials> {
        let key_json = std::fs::read_to_string(&self.credentials_path)?;
        Ok(RegistryCredentials::json_key(key_json))
    }

    /// All tags currently present for a project, `latest` included.
    async fn list_tags(&self, project_id: Uuid) -> RegistryResult<Vec<String>> {
        let (host, path) = self.registry_host_and_path();
        let name = if path.is_empty() {
            project_id.to_string()
        } else {
            format!("{}/{}", path, project_id)
        };
        let credentials = self.http_credentials()?;

        #[derive(Deserialize)]
        struct TagList {
            #[serde(default)]
            tags: Option<Vec<String>>,
        }

        let response = self
            .http
            .get(format!("https://{}/v2/{}/tags/list", host, name))
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(RegistryError::Api { status, message });
        }

        let list: TagList = response.json().await?;
        Ok(list.tags.unwrap_or_default())
    }
}

#[async_trait]
impl ImageRegistry for DockerImageRegistry {
    async fn commit(&self, container: &str, repo: &str, tag: &str) -> RegistryResult<String> {
        let options = CommitContainerOptions {
            container: container.to_string(),
            repo: repo.to_string(),
            tag: tag.to_string(),
            pause: true,
            ..Default::default()
        };

        let commit = self
            .docker
            .commit_container(options, Config::<String>::default())
            .await?;

        let image_id = commit
            .id
            .ok_or_else(|| RegistryError::Other("commit returned no image id".into()))?;
        info!("Committed {} to {}:{}", container, repo, tag);
        Ok(image_id)
    }

    async fn tag(&self, image_id: &str, repo: &str, tag: &str) -> RegistryResult<()> {
        let options = TagImageOptions {
            repo: repo.to_string(),
            tag: tag.to_string(),
        };
        self.docker.tag_image(image_id, Some(options)).await?;
        Ok(())
    }

    async fn push(
        &self,
        repo: &str,
        tag: &str,
        credentials: &RegistryCredentials,
    ) -> RegistryResult<()> {
        let reference = format!("{}:{}", repo, tag);
        info!("Pushing {}", reference);

        let options = PushImageOptions { tag };
        let docker_credentials = DockerCredentials {
            username: Some(credentials.username.clone()),
            password: Some(credentials.password.clone()),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .push_image(repo, Some(options), Some(docker_credentials));

        while let Some(chunk) = stream.next().await {
            let info = chunk?;
            if let Some(error) = info.error {
                return Err(RegistryError::Push {
                    reference,
                    message: error,
                });
            }
            if let Some(status) = info.status {
                debug!("Push {}: {}", reference, status);
            }
        }

        info!("Pushed {}", reference);
        Ok(())
    }

    async fn pull(
        &self,
        image_ref: &str,
        credentials: &RegistryCredentials,
    ) -> RegistryResult<()> {
        // Local copy wins; no network traffic
        match self.docker.inspect_image(image_ref).await {
            Ok(_) => {
                debug!("Image {} already present locally", image_ref);
                return Ok(());
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(RegistryError::Docker(e)),
        }

        info!("Pulling {}", image_ref);

        let options = CreateImageOptions {
            from_image: image_ref,
            ..Default::default()
        };
        let docker_credentials = DockerCredentials {
            username: Some(credentials.username.clone()),
            password: Some(credentials.password.clone()),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .create_image(Some(options), None, Some(docker_credentials));

        while let Some(chunk) = stream.next().await {
            let info = chunk?;
            if let Some(status) = info.status {
                debug!("Pull {}: {}", image_ref, status);
            }
        }

        info!("Pulled {}", image_ref);
        Ok(())
    }

    async fn list_versions(&self, project_id: Uuid) -> RegistryResult<Vec<SnapshotVersion>> {
        let tags = self.list_tags(project_id).await?;

        let mut versions: Vec<SnapshotVersion> = tags
            .iter()
            .filter(|tag| tag.as_str() != "latest")
            .filter_map(|tag| {
                parse_snapshot_tag(tag).map(|created_at| SnapshotVersion {
                    tag: tag.clone(),
                    created_at,
                })
            })
            .collect();

        versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(versions)
    }

    async fn delete_all_versions(&self, project_id: Uuid) -> RegistryResult<()> {
        let tags = match self.list_tags(project_id).await {
            Ok(tags) => tags,
            Err(e) => {
                warn!("Failed to list versions for {}: {}", project_id, e);
                return Ok(());
            }
        };

        let (host, path) = self.registry_host_and_path();
        let name = if path.is_empty() {
            project_id.to_string()
        } else {
            format!("{}/{}", path, project_id)
        };
        let credentials = self.http_credentials()?;

        for tag in tags {
            // Resolve the tag to its manifest digest, then delete by digest
            let response = self
                .http
                .head(format!("https://{}/v2/{}/manifests/{}", host, name, tag))
                .basic_auth(&credentials.username, Some(&credentials.password))
                .header("Accept", MANIFEST_MEDIA_TYPE)
                .send()
                .await;

            let digest = match response {
                Ok(r) => r
                    .headers()
                    .get("Docker-Content-Digest")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string()),
                Err(e) => {
                    warn!("Manifest lookup failed for {}:{}: {}", name, tag, e);
                    continue;
                }
            };

            let Some(digest) = digest else {
                warn!("No digest for {}:{}", name, tag);
                continue;
            };

            match self
                .http
                .delete(format!("https://{}/v2/{}/manifests/{}", host, name, digest))
                .basic_auth(&credentials.username, Some(&credentials.password))
                .send()
                .await
            {
                Ok(r) if r.status().is_success() || r.status() == StatusCode::NOT_FOUND => {
                    debug!("Deleted {}:{} ({})", name, tag, digest);
                }
                Ok(r) => warn!("Delete of {}:{} returned {}", name, tag, r.status()),
                Err(e) => warn!("Delete of {}:{} failed: {}", name, tag, e),
            }
        }

        Ok(())
    }
}
