//! Object-storage IAM adapter
//!
//! Per-user tenant isolation: each user gets a bucket and a cloud identity
//! whose credentials are injected into that user's sandboxes. All remote
//! operations are idempotent against pre-existing state so the provisioner
//! can retry freely.

mod gcs;

pub use gcs::GcsIam;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Adapter errors
#[derive(Debug, Error)]
pub enum StorageIamError {
    #[error("request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("cloud API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type StorageIamResult<T> = Result<T, StorageIamError>;

/// Deterministic bucket name for a user: `{tenant}-u-{sha256(user_id)[..12]}`.
///
/// Short enough to satisfy the backend's 63-character bucket naming rules
/// for any reasonable tenant root.
pub fn make_bucket_name(user_id: &str, tenant: &str) -> String {
    let digest = hex::encode(Sha256::digest(user_id.as_bytes()));
    format!("{}-u-{}", tenant, &digest[..12])
}

/// Deterministic identity id for a user: `sa-{sha256(user_id)[..26]}`.
///
/// Identity id constraints: 6-30 characters, lowercase letters, digits,
/// and hyphens; must start with a letter and not end with a hyphen. The
/// fixed `sa-` prefix plus 26 hex characters lands at 29.
pub fn make_identity_id(user_id: &str) -> String {
    let digest = hex::encode(Sha256::digest(user_id.as_bytes()));
    format!("sa-{}", &digest[..26])
}

/// Tenant operations the provisioner and lifecycle controller depend on.
#[async_trait]
pub trait ObjectStorageIam: Send + Sync {
    /// Create a bucket. Treats "already exists" as success.
    async fn create_bucket(&self, name: &str) -> StorageIamResult<()>;

    /// Create a per-user cloud identity. Returns its handle (email form).
    /// Treats "already exists" as success, returning the derived handle.
    async fn create_identity(&self, user_id: &str) -> StorageIamResult<String>;

    /// Generate key material for an identity. Returns an opaque blob the
    /// sandbox can use against the bucket.
    async fn create_credential(&self, identity: &str) -> StorageIamResult<String>;

    /// Grant object read/write within the bucket to the identity.
    async fn grant_bucket_iam(&self, identity: &str, bucket: &str) -> StorageIamResult<()>;

    /// Delete every object under a prefix. Idempotent.
    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> StorageIamResult<()>;

    /// Force-delete a bucket. Idempotent.
    async fn delete_bucket(&self, bucket: &str) -> StorageIamResult<()>;

    /// Delete an identity. Idempotent.
    async fn delete_identity(&self, identity: &str) -> StorageIamResult<()>;
}
