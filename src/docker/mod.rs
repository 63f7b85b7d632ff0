//! Container runtime adapter
//!
//! Creates and tears down per-project Docker resources: an isolated bridge
//! network, a named workspace volume, and the sandbox container itself.
//! Resource names are deterministic from the project identity so every
//! operation can address them without persisted handles.

mod runtime;

pub use runtime::DockerRuntime;

use std::net::TcpListener;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use thiserror::Error;
use uuid::Uuid;

/// Host port range probed for sandbox SSH publishing.
pub const PORT_RANGE_START: u16 = 30000;
pub const PORT_RANGE_END: u16 = 60000;

/// Attempts when the daemon reports a port collision at container start.
pub const MAX_PORT_RETRIES: u32 = 3;

/// Well-known side-car the terminal gateway runs in. It is attached to a
/// sandbox's network so it can reach the in-container PTY server.
pub const PROXY_CONTAINER: &str = "terminal-proxy";

/// Workspace mount point inside the sandbox.
pub const WORKSPACE_MOUNT: &str = "/home/agent";

/// Runtime adapter errors
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container already exists: {0}")]
    ContainerExists(String),

    #[error("Network already exists: {0}")]
    NetworkExists(String),

    #[error("Container {0} is not running")]
    NotRunning(String),

    #[error("Container not connected to network {0}")]
    NotAttached(String),

    #[error("No free port found in range {0}-{1}")]
    PortRangeExhausted(u16, u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Environment a sandbox container boots with.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Image to run (base image on create, snapshot image on fast restore)
    pub image: String,

    /// Owner's object-storage bucket
    pub bucket: String,

    /// Workspace prefix within the bucket
    pub storage_prefix: String,

    /// Opaque credential blob the in-container daemons use for the bucket
    pub credential_json: String,

    /// Public key installed for the `agent` user
    pub ssh_public_key: String,
}

/// Output of an in-container exec.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

/// Deterministic network name for a project.
pub fn network_name(project_id: Uuid) -> String {
    format!("net-{}", project_id)
}

/// Deterministic volume name for a project.
pub fn volume_name(project_id: Uuid) -> String {
    format!("vol-{}", project_id)
}

/// Deterministic container name for a project.
pub fn container_name(project_id: Uuid) -> String {
    format!("sandbox-{}", project_id)
}

/// Find a free TCP port in the given range.
///
/// Binds a listener to verify availability. Ports are tried in random
/// order to reduce contention under concurrent allocators.
pub fn find_free_port(start: u16, end: u16) -> RuntimeResult<u16> {
    let mut ports: Vec<u16> = (start..=end).collect();
    ports.shuffle(&mut rand::thread_rng());

    for port in ports {
        if TcpListener::bind(("0.0.0.0", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(RuntimeError::PortRangeExhausted(start, end))
}

/// Container runtime operations the lifecycle controller, snapshot engine,
/// and terminal gateway depend on. Abstracted so those components can be
/// exercised against a mock runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create the project's isolated bridge network. IPv6 disabled.
    async fn create_network(&self, project_id: Uuid) -> RuntimeResult<String>;

    /// Remove the project's network. Absence is success.
    async fn delete_network(&self, project_id: Uuid) -> RuntimeResult<()>;

    /// Create the project's named workspace volume.
    async fn create_volume(&self, project_id: Uuid) -> RuntimeResult<String>;

    /// Remove the project's volume. Absence is success.
    async fn delete_volume(&self, project_id: Uuid) -> RuntimeResult<()>;

    /// Full creation: network, volume, then [`run_container`]. Partially
    /// created resources are rolled back on failure.
    async fn create_container(
        &self,
        project_id: Uuid,
        spec: &SandboxSpec,
    ) -> RuntimeResult<(String, u16)>;

    /// Run a sandbox container on the project's existing network and
    /// volume, publishing a freshly allocated SSH port. Retries internally
    /// when the daemon rejects the chosen port as already allocated.
    /// Returns `(container_id, ssh_port)`.
    async fn run_container(
        &self,
        project_id: Uuid,
        spec: &SandboxSpec,
    ) -> RuntimeResult<(String, u16)>;

    /// Start a stopped container.
    async fn start_container(&self, project_id: Uuid) -> RuntimeResult<()>;

    /// Gracefully stop a running container: termination signal, then kill
    /// after `timeout_secs`.
    async fn stop_container(&self, project_id: Uuid, timeout_secs: i64) -> RuntimeResult<()>;

    /// Remove the container (force). Absence is success. Volume and
    /// network are left alone.
    async fn delete_container(&self, project_id: Uuid) -> RuntimeResult<()>;

    /// IPv4 address of the running container on the project's network.
    async fn get_container_ip(&self, project_id: Uuid) -> RuntimeResult<String>;

    /// Attach the terminal-proxy side-car to the project's network.
    /// Idempotent when already attached.
    async fn connect_proxy_to_network(&self, project_id: Uuid) -> RuntimeResult<()>;

    /// Detach the terminal-proxy side-car. Idempotent when already absent.
    async fn disconnect_proxy_from_network(&self, project_id: Uuid) -> RuntimeResult<()>;

    /// Remove container, volume, and network in that order, each tolerant
    /// of absence.
    async fn cleanup_project_resources(&self, project_id: Uuid) -> RuntimeResult<()>;

    /// Run a command inside the running container.
    async fn exec(
        &self,
        project_id: Uuid,
        cmd: Vec<String>,
        user: &str,
    ) -> RuntimeResult<ExecOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(network_name(id), format!("net-{}", id));
        assert_eq!(volume_name(id), format!("vol-{}", id));
        assert_eq!(container_name(id), format!("sandbox-{}", id));
        assert_eq!(network_name(id), network_name(id));
    }

    #[test]
    fn find_free_port_returns_distinct_bindable_ports() {
        // Hold each returned port open so the next call must pick another.
        let mut held = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for _ in 0..5 {
            let port = find_free_port(41000, 41010).unwrap();
            assert!((41000..=41010).contains(&port));
            assert!(seen.insert(port), "port {} returned twice", port);
            held.push(TcpListener::bind(("0.0.0.0", port)).unwrap());
        }
    }

    #[test]
    fn find_free_port_exhausts_bound_range() {
        let start = 42100;
        let end = 42103;
        let _held: Vec<_> = (start..=end)
            .map(|p| TcpListener::bind(("0.0.0.0", p)).unwrap())
            .collect();

        let err = find_free_port(start, end).unwrap_err();
        assert!(matches!(err, RuntimeError::PortRangeExhausted(s, e) if s == start && e == end));
    }
}
