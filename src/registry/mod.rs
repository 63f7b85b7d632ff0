//! Image registry adapter
//!
//! Snapshots live at `{registry_root}/{project_id}` with a `latest` alias
//! and one immutable `YYYYMMDD-HHMMSS` tag per snapshot. Commit/tag/push/
//! pull go through the Docker daemon; tag listing and deletion talk to the
//! registry's HTTP API directly.

mod docker;

pub use docker::DockerImageRegistry;

use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use thiserror::Error;
use uuid::Uuid;

/// Snapshot tag format, UTC.
pub const SNAPSHOT_TAG_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Registry adapter errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("push failed for {reference}: {message}")]
    Push { reference: String, message: String },

    #[error("registry API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Credentials for the remote registry.
#[derive(Debug, Clone)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

impl RegistryCredentials {
    /// Authenticate with a service-account key JSON blob.
    pub fn json_key(key_json: impl Into<String>) -> Self {
        Self {
            username: "_json_key".to_string(),
            password: key_json.into(),
        }
    }
}

/// One snapshot version of a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotVersion {
    pub tag: String,
    pub created_at: DateTime<Utc>,
}

fn snapshot_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{8}-\d{6}$").expect("valid regex"))
}

/// Parse a snapshot tag into its UTC timestamp. `None` for `latest` or any
/// tag that does not match the snapshot shape.
pub fn parse_snapshot_tag(tag: &str) -> Option<DateTime<Utc>> {
    if !snapshot_tag_re().is_match(tag) {
        return None;
    }
    NaiveDateTime::parse_from_str(tag, SNAPSHOT_TAG_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Format a snapshot tag for the given instant.
pub fn format_snapshot_tag(at: DateTime<Utc>) -> String {
    at.format(SNAPSHOT_TAG_FORMAT).to_string()
}

/// Registry operations the snapshot engine and lifecycle controller use.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Snapshot a container's root filesystem into an image. Paths under
    /// volume mounts are excluded by the runtime. Returns the image id.
    async fn commit(&self, container: &str, repo: &str, tag: &str) -> RegistryResult<String>;

    /// Apply an additional tag to an image.
    async fn tag(&self, image_id: &str, repo: &str, tag: &str) -> RegistryResult<()>;

    /// Push one tag to the remote registry.
    async fn push(
        &self,
        repo: &str,
        tag: &str,
        credentials: &RegistryCredentials,
    ) -> RegistryResult<()>;

    /// Pull an image. No network traffic when a local copy exists.
    async fn pull(&self, image_ref: &str, credentials: &RegistryCredentials)
        -> RegistryResult<()>;

    /// Snapshot versions for a project, newest first, excluding `latest`.
    async fn list_versions(&self, project_id: Uuid) -> RegistryResult<Vec<SnapshotVersion>>;

    /// Best-effort deletion of every version of a project.
    async fn delete_all_versions(&self, project_id: Uuid) -> RegistryResult<()>;
}
