//! Test doubles for the adapter seams
//!
//! Hand-rolled mocks for the container runtime, object-storage IAM, and
//! image registry traits. Each records its calls so tests can assert on
//! which external operations an orchestration path performed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::cloud::{make_identity_id, ObjectStorageIam, StorageIamError, StorageIamResult};
use crate::docker::{
    container_name, network_name, volume_name, ContainerRuntime, ExecOutput, RuntimeError,
    RuntimeResult, SandboxSpec,
};
use crate::registry::{
    ImageRegistry, RegistryCredentials, RegistryError, RegistryResult, SnapshotVersion,
};

/// Mock container runtime
#[derive(Default)]
pub struct MockRuntime {
    calls: Mutex<Vec<String>>,
    fail_run: AtomicBool,
    network_exists: AtomicBool,
    exec_exit_code: AtomicI64,
    port: AtomicU16,
    container_id: Mutex<String>,
    container_ip: Mutex<Option<String>>,
}

impl MockRuntime {
    pub fn shared() -> Arc<Self> {
        let mock = Self {
            port: AtomicU16::new(30001),
            container_id: Mutex::new("mock-container".to_string()),
            container_ip: Mutex::new(Some("172.18.0.2".to_string())),
            ..Default::default()
        };
        Arc::new(mock)
    }

    fn log(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls.lock().iter().any(|c| c.starts_with(prefix))
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn set_fail_run(&self, fail: bool) {
        self.fail_run.store(fail, Ordering::SeqCst);
    }

    pub fn set_network_exists(&self, exists: bool) {
        self.network_exists.store(exists, Ordering::SeqCst);
    }

    pub fn set_exec_exit_code(&self, code: i64) {
        self.exec_exit_code.store(code, Ordering::SeqCst);
    }

    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::SeqCst);
    }

    pub fn set_container_id(&self, id: &str) {
        *self.container_id.lock() = id.to_string();
    }

    pub fn set_container_ip(&self, ip: Option<&str>) {
        *self.container_ip.lock() = ip.map(|s| s.to_string());
    }

    fn launch(&self, _project_id: Uuid) -> RuntimeResult<(String, u16)> {
        if self.fail_run.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other("runtime unavailable".into()));
        }
        Ok((
            self.container_id.lock().clone(),
            self.port.load(Ordering::SeqCst),
        ))
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_network(&self, project_id: Uuid) -> RuntimeResult<String> {
        self.log(format!("create_network:{}", project_id));
        if self.network_exists.load(Ordering::SeqCst) {
            return Err(RuntimeError::NetworkExists(network_name(project_id)));
        }
        Ok(network_name(project_id))
    }

    async fn delete_network(&self, project_id: Uuid) -> RuntimeResult<()> {
        self.log(format!("delete_network:{}", project_id));
        Ok(())
    }

    async fn create_volume(&self, project_id: Uuid) -> RuntimeResult<String> {
        self.log(format!("create_volume:{}", project_id));
        Ok(volume_name(project_id))
    }

    async fn delete_volume(&self, project_id: Uuid) -> RuntimeResult<()> {
        self.log(format!("delete_volume:{}", project_id));
        Ok(())
    }

    async fn create_container(
        &self,
        project_id: Uuid,
        _spec: &SandboxSpec,
    ) -> RuntimeResult<(String, u16)> {
        self.log(format!("create_container:{}", project_id));
        self.launch(project_id)
    }

    async fn run_container(
        &self,
        project_id: Uuid,
        _spec: &SandboxSpec,
    ) -> RuntimeResult<(String, u16)> {
        self.log(format!("run_container:{}", project_id));
        self.launch(project_id)
    }

    async fn start_container(&self, project_id: Uuid) -> RuntimeResult<()> {
        self.log(format!("start_container:{}", project_id));
        Ok(())
    }

    async fn stop_container(&self, project_id: Uuid, _timeout_secs: i64) -> RuntimeResult<()> {
        self.log(format!("stop_container:{}", project_id));
        Ok(())
    }

    async fn delete_container(&self, project_id: Uuid) -> RuntimeResult<()> {
        self.log(format!("delete_container:{}", project_id));
        Ok(())
    }

    async fn get_container_ip(&self, project_id: Uuid) -> RuntimeResult<String> {
        self.log(format!("get_container_ip:{}", project_id));
        self.container_ip
            .lock()
            .clone()
            .ok_or_else(|| RuntimeError::NotRunning(container_name(project_id)))
    }

    async fn connect_proxy_to_network(&self, project_id: Uuid) -> RuntimeResult<()> {
        self.log(format!("connect_proxy:{}", project_id));
        Ok(())
    }

    async fn disconnect_proxy_from_network(&self, project_id: Uuid) -> RuntimeResult<()> {
        self.log(format!("disconnect_proxy:{}", project_id));
        Ok(())
    }

    async fn cleanup_project_resources(&self, project_id: Uuid) -> RuntimeResult<()> {
        self.log(format!("cleanup_project_resources:{}", project_id));
        Ok(())
    }

    async fn exec(
        &self,
        project_id: Uuid,
        cmd: Vec<String>,
        _user: &str,
    ) -> RuntimeResult<ExecOutput> {
        self.log(format!(
            "exec:{}:{}",
            project_id,
            cmd.first().cloned().unwrap_or_default()
        ));
        Ok(ExecOutput {
            exit_code: self.exec_exit_code.load(Ordering::SeqCst),
            output: String::new(),
        })
    }
}

/// Mock object-storage IAM adapter
#[derive(Default)]
pub struct MockStorageIam {
    calls: Mutex<Vec<String>>,
    fail_once: Mutex<HashSet<String>>,
}

impl MockStorageIam {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn log(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls.lock().iter().any(|c| c.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Make the next invocation of `method` fail; later calls succeed.
    pub fn fail_once(&self, method: &str) {
        self.fail_once.lock().insert(method.to_string());
    }

    fn check_failure(&self, method: &str) -> StorageIamResult<()> {
        if self.fail_once.lock().remove(method) {
            return Err(StorageIamError::Other(format!("{} unavailable", method)));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStorageIam for MockStorageIam {
    async fn create_bucket(&self, name: &str) -> StorageIamResult<()> {
        self.log(format!("create_bucket:{}", name));
        self.check_failure("create_bucket")
    }

    async fn create_identity(&self, user_id: &str) -> StorageIamResult<String> {
        self.log(format!("create_identity:{}", user_id));
        self.check_failure("create_identity")?;
        Ok(format!("{}@tenant.test.iam", make_identity_id(user_id)))
    }

    async fn create_credential(&self, identity: &str) -> StorageIamResult<String> {
        self.log(format!("create_credential:{}", identity));
        self.check_failure("create_credential")?;
        Ok("{\"type\":\"service_account\"}".to_string())
    }

    async fn grant_bucket_iam(&self, identity: &str, bucket: &str) -> StorageIamResult<()> {
        self.log(format!("grant_bucket_iam:{}:{}", identity, bucket));
        self.check_failure("grant_bucket_iam")
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> StorageIamResult<()> {
        self.log(format!("delete_prefix:{}:{}", bucket, prefix));
        self.check_failure("delete_prefix")
    }

    async fn delete_bucket(&self, bucket: &str) -> StorageIamResult<()> {
        self.log(format!("delete_bucket:{}", bucket));
        self.check_failure("delete_bucket")
    }

    async fn delete_identity(&self, identity: &str) -> StorageIamResult<()> {
        self.log(format!("delete_identity:{}", identity));
        self.check_failure("delete_identity")
    }
}

/// Mock image registry
#[derive(Default)]
pub struct MockRegistry {
    calls: Mutex<Vec<String>>,
    local_images: Mutex<HashSet<String>>,
    versions: Mutex<Vec<SnapshotVersion>>,
    fail_push: AtomicBool,
    fail_delete: AtomicBool,
}

impl MockRegistry {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn log(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls.lock().iter().any(|c| c.starts_with(prefix))
    }

    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn add_local_image(&self, image_ref: &str) {
        self.local_images.lock().insert(image_ref.to_string());
    }

    pub fn set_versions(&self, versions: Vec<SnapshotVersion>) {
        *self.versions.lock() = versions;
    }

    pub fn set_fail_push(&self, fail: bool) {
        self.fail_push.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ImageRegistry for MockRegistry {
    async fn commit(&self, container: &str, repo: &str, tag: &str) -> RegistryResult<String> {
        self.log(format!("commit:{}:{}:{}", container, repo, tag));
        Ok("sha256:mockimage".to_string())
    }

    async fn tag(&self, image_id: &str, repo: &str, tag: &str) -> RegistryResult<()> {
        self.log(format!("tag:{}:{}:{}", image_id, repo, tag));
        Ok(())
    }

    async fn push(
        &self,
        repo: &str,
        tag: &str,
        _credentials: &RegistryCredentials,
    ) -> RegistryResult<()> {
        self.log(format!("push:{}:{}", repo, tag));
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(RegistryError::Push {
                reference: format!("{}:{}", repo, tag),
                message: "push rejected".into(),
            });
        }
        Ok(())
    }

    async fn pull(
        &self,
        image_ref: &str,
        _credentials: &RegistryCredentials,
    ) -> RegistryResult<()> {
        if self.local_images.lock().contains(image_ref) {
            self.log(format!("pull_skipped:{}", image_ref));
        } else {
            self.log(format!("pull:{}", image_ref));
        }
        Ok(())
    }

    async fn list_versions(&self, project_id: Uuid) -> RegistryResult<Vec<SnapshotVersion>> {
        self.log(format!("list_versions:{}", project_id));
        Ok(self.versions.lock().clone())
    }

    async fn delete_all_versions(&self, project_id: Uuid) -> RegistryResult<()> {
        self.log(format!("delete_all_versions:{}", project_id));
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(RegistryError::Api {
                status: 500,
                message: "registry unavailable".into(),
            });
        }
        Ok(())
    }
}
