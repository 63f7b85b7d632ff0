//! Tenant provisioner
//!
//! Lazily materializes a user's cloud tenant: bucket, identity, and
//! credential key. Each step is persisted as soon as it completes so a
//! crashed or retried provisioning run skips finished work. Concurrent
//! runs for the same user converge because every remote operation is
//! idempotent and the persisted values are equal.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::cloud::{make_bucket_name, ObjectStorageIam, StorageIamError};
use crate::db::{Store, StoreError, UserRecord};

/// Provisioner errors
#[derive(Debug, Error)]
pub enum TenantError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageIamError),

    #[error("{0}")]
    Inconsistent(String),
}

pub type TenantResult<T> = Result<T, TenantError>;

/// The per-user material a sandbox boots with.
#[derive(Debug, Clone)]
pub struct TenantMaterial {
    pub bucket: String,
    pub credential_json: String,
}

/// Tenant provisioner
pub struct TenantProvisioner {
    store: Arc<dyn Store>,
    storage: Arc<dyn ObjectStorageIam>,

    /// Tenant root used in bucket naming
    tenant_root: String,
}

impl TenantProvisioner {
    pub fn new(
        store: Arc<dyn Store>,
        storage: Arc<dyn ObjectStorageIam>,
        tenant_root: &str,
    ) -> Self {
        Self {
            store,
            storage,
            tenant_root: tenant_root.to_string(),
        }
    }

    /// Ensure the user has a bucket, identity, and credential key.
    ///
    /// Short-circuits when the credential is already set (the final step).
    pub async fn ensure_tenant(&self, user: &UserRecord) -> TenantResult<TenantMaterial> {
        if let Some(credential_json) = &user.credential_json {
            let bucket = user.bucket.clone().ok_or_else(|| {
                TenantError::Inconsistent(format!(
                    "user {} has credential but no bucket",
                    user.id
                ))
            })?;
            return Ok(TenantMaterial {
                bucket,
                credential_json: credential_json.clone(),
            });
        }

        let user_id = user.id.to_string();
        info!("[user:{}] Provisioning tenant material...", user_id);

        let bucket = match &user.bucket {
            Some(bucket) => bucket.clone(),
            None => {
                let bucket = make_bucket_name(&user_id, &self.tenant_root);
                info!("[user:{}] Creating bucket {}...", user_id, bucket);
                self.storage.create_bucket(&bucket).await?;
                self.store.set_user_bucket(user.id, &bucket).await?;
                bucket
            }
        };

        let identity = match &user.identity {
            Some(identity) => identity.clone(),
            None => {
                info!("[user:{}] Creating cloud identity...", user_id);
                let identity = self.storage.create_identity(&user_id).await?;
                self.store.set_user_identity(user.id, &identity).await?;

                info!("[user:{}] Granting bucket IAM on {}...", user_id, bucket);
                self.storage.grant_bucket_iam(&identity, &bucket).await?;
                identity
            }
        };

        info!("[user:{}] Creating credential key...", user_id);
        let credential_json = self.storage.create_credential(&identity).await?;
        self.store
            .set_user_credential(user.id, &credential_json)
            .await?;

        info!("[user:{}] Tenant material provisioned", user_id);
        Ok(TenantMaterial {
            bucket,
            credential_json,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::testing::MockStorageIam;

    async fn seeded_user(store: &MemoryStore) -> UserRecord {
        store.create_user("a@ex.com", "digest").await.unwrap()
    }

    fn provisioner(
        store: &Arc<MemoryStore>,
        storage: &Arc<MockStorageIam>,
    ) -> TenantProvisioner {
        TenantProvisioner::new(
            store.clone() as Arc<dyn Store>,
            storage.clone() as Arc<dyn ObjectStorageIam>,
            "sandbox-dev",
        )
    }

    #[tokio::test]
    async fn provisions_all_steps_in_order() {
        let store = Arc::new(MemoryStore::new());
        let storage = MockStorageIam::shared();
        let user = seeded_user(&store).await;

        let material = provisioner(&store, &storage)
            .ensure_tenant(&user)
            .await
            .unwrap();

        assert!(material.bucket.starts_with("sandbox-dev-u-"));
        assert!(storage.called("create_bucket"));
        assert!(storage.called("create_identity"));
        assert!(storage.called("grant_bucket_iam"));
        assert!(storage.called("create_credential"));

        let stored = store.user_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.bucket.as_deref(), Some(material.bucket.as_str()));
        assert!(stored.identity.is_some());
        assert!(stored.credential_json.is_some());
    }

    #[tokio::test]
    async fn short_circuits_when_already_provisioned() {
        let store = Arc::new(MemoryStore::new());
        let storage = MockStorageIam::shared();
        let user = seeded_user(&store).await;

        let provisioner = provisioner(&store, &storage);
        provisioner.ensure_tenant(&user).await.unwrap();
        storage.clear_calls();

        let user = store.user_by_id(user.id).await.unwrap().unwrap();
        provisioner.ensure_tenant(&user).await.unwrap();

        assert!(storage.calls().is_empty(), "no remote calls expected");
    }

    #[tokio::test]
    async fn retry_skips_completed_steps() {
        let store = Arc::new(MemoryStore::new());
        let storage = MockStorageIam::shared();
        let user = seeded_user(&store).await;

        // First run dies at the credential step, after bucket and identity
        // have been persisted.
        storage.fail_once("create_credential");
        let provisioner = provisioner(&store, &storage);
        provisioner.ensure_tenant(&user).await.unwrap_err();

        let partial = store.user_by_id(user.id).await.unwrap().unwrap();
        assert!(partial.bucket.is_some());
        assert!(partial.identity.is_some());
        assert!(partial.credential_json.is_none());

        // Retry completes without redoing bucket or identity creation
        provisioner.ensure_tenant(&partial).await.unwrap();
        assert_eq!(storage.count("create_bucket"), 1);
        assert_eq!(storage.count("create_identity"), 1);
        assert_eq!(storage.count("create_credential"), 2);
    }
}
