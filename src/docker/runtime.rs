//! Bollard-backed container runtime

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{DeviceMapping, EndpointSettings, HostConfig, Mount, MountTypeEnum, PortBinding};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    container_name, find_free_port, network_name, volume_name, ContainerRuntime, ExecOutput,
    RuntimeError, RuntimeResult, SandboxSpec, MAX_PORT_RETRIES, PORT_RANGE_END, PORT_RANGE_START,
    PROXY_CONTAINER, WORKSPACE_MOUNT,
};

/// Sandbox memory limit: 1 GiB.
const MEMORY_LIMIT_BYTES: i64 = 1024 * 1024 * 1024;

/// Sandbox CPU limit: 1 core.
const NANO_CPUS: i64 = 1_000_000_000;

/// Docker implementation of [`ContainerRuntime`]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    pub fn new() -> RuntimeResult<Self> {
        let client = Docker::connect_with_local_defaults()?;
        Ok(Self { client })
    }

    /// Use an existing Docker client.
    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }

    fn is_not_found(e: &bollard::errors::Error) -> bool {
        matches!(
            e,
            bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
        )
    }

    fn server_message(e: &bollard::errors::Error) -> Option<&str> {
        match e {
            bollard::errors::Error::DockerResponseServerError { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Build the container configuration for a sandbox.
    fn sandbox_config(
        project_id: Uuid,
        spec: &SandboxSpec,
        ssh_port: u16,
    ) -> Config<String> {
        let env = vec![
            format!("PROJECT_ID={}", project_id),
            format!("STORAGE_BUCKET={}", spec.bucket),
            format!("STORAGE_PREFIX={}", spec.storage_prefix),
            format!("STORAGE_CREDENTIALS={}", spec.credential_json),
            format!("SSH_PUBLIC_KEY={}", spec.ssh_public_key),
        ];

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert("22/tcp".to_string(), HashMap::new());

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            "22/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(ssh_port.to_string()),
            }]),
        );

        let mounts = vec![Mount {
            target: Some(WORKSPACE_MOUNT.to_string()),
            source: Some(volume_name(project_id)),
            typ: Some(MountTypeEnum::VOLUME),
            read_only: Some(false),
            ..Default::default()
        }];

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            mounts: Some(mounts),

            // Fixed per-container limits
            memory: Some(MEMORY_LIMIT_BYTES),
            nano_cpus: Some(NANO_CPUS),

            // FUSE-backed workspace mounts need the device and SYS_ADMIN
            cap_add: Some(vec!["SYS_ADMIN".to_string()]),
            devices: Some(vec![DeviceMapping {
                path_on_host: Some("/dev/fuse".to_string()),
                path_in_container: Some("/dev/fuse".to_string()),
                cgroup_permissions: Some("rwm".to_string()),
            }]),
            security_opt: Some(vec!["apparmor:unconfined".to_string()]),

            network_mode: Some(network_name(project_id)),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_network(&self, project_id: Uuid) -> RuntimeResult<String> {
        let name = network_name(project_id);

        let options = CreateNetworkOptions {
            name: name.clone(),
            driver: "bridge".to_string(),
            enable_ipv6: false,
            ..Default::default()
        };

        match self.client.create_network(options).await {
            Ok(_) => {
                debug!("Created network {}", name);
                Ok(name)
            }
            Err(e) => {
                if let Some(msg) = Self::server_message(&e) {
                    if msg.to_lowercase().contains("already exists") {
                        return Err(RuntimeError::NetworkExists(name));
                    }
                }
                Err(RuntimeError::Docker(e))
            }
        }
    }

    async fn delete_network(&self, project_id: Uuid) -> RuntimeResult<()> {
        let name = network_name(project_id);

        match self.client.remove_network(&name).await {
            Ok(_) => {
                debug!("Removed network {}", name);
                Ok(())
            }
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(RuntimeError::Docker(e)),
        }
    }

    async fn create_volume(&self, project_id: Uuid) -> RuntimeResult<String> {
        let name = volume_name(project_id);

        let options = CreateVolumeOptions {
            name: name.clone(),
            ..Default::default()
        };

        self.client.create_volume(options).await?;
        debug!("Created volume {}", name);
        Ok(name)
    }

    async fn delete_volume(&self, project_id: Uuid) -> RuntimeResult<()> {
        let name = volume_name(project_id);

        match self
            .client
            .remove_volume(&name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(_) => {
                debug!("Removed volume {}", name);
                Ok(())
            }
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(RuntimeError::Docker(e)),
        }
    }

    async fn create_container(
        &self,
        project_id: Uuid,
        spec: &SandboxSpec,
    ) -> RuntimeResult<(String, u16)> {
        let name = container_name(project_id);

        // Reject duplicate container names before touching any resources
        match self.client.inspect_container(&name, None).await {
            Ok(_) => return Err(RuntimeError::ContainerExists(name)),
            Err(e) if Self::is_not_found(&e) => {}
            Err(e) => return Err(RuntimeError::Docker(e)),
        }

        self.create_network(project_id).await?;

        if let Err(e) = self.create_volume(project_id).await {
            if let Err(cleanup) = self.delete_network(project_id).await {
                warn!("Network rollback failed for {}: {}", project_id, cleanup);
            }
            return Err(e);
        }

        match self.run_container(project_id, spec).await {
            Ok(created) => Ok(created),
            Err(e) => {
                if let Err(cleanup) = self.delete_volume(project_id).await {
                    warn!("Volume rollback failed for {}: {}", project_id, cleanup);
                }
                if let Err(cleanup) = self.delete_network(project_id).await {
                    warn!("Network rollback failed for {}: {}", project_id, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn run_container(
        &self,
        project_id: Uuid,
        spec: &SandboxSpec,
    ) -> RuntimeResult<(String, u16)> {
        let name = container_name(project_id);

        for attempt in 0..MAX_PORT_RETRIES {
            let ssh_port = find_free_port(PORT_RANGE_START, PORT_RANGE_END)?;
            let config = Self::sandbox_config(project_id, spec, ssh_port);

            let options = CreateContainerOptions {
                name: name.as_str(),
                platform: None,
            };

            let created = self
                .client
                .create_container(Some(options), config)
                .await
                .map_err(|e| {
                    if let bollard::errors::Error::DockerResponseServerError {
                        status_code: 409,
                        ..
                    } = e
                    {
                        RuntimeError::ContainerExists(name.clone())
                    } else {
                        RuntimeError::Docker(e)
                    }
                })?;

            match self
                .client
                .start_container(&name, None::<StartContainerOptions<String>>)
                .await
            {
                Ok(_) => {
                    info!(
                        "Started container {} (SSH port {})",
                        name, ssh_port
                    );
                    return Ok((created.id, ssh_port));
                }
                Err(e) => {
                    // The created-but-unstartable container must not linger;
                    // its name would collide with the next attempt.
                    if let Err(cleanup) = self.delete_container(project_id).await {
                        warn!("Failed to remove unstartable container {}: {}", name, cleanup);
                    }

                    let port_taken = Self::server_message(&e)
                        .map(|m| m.to_lowercase().contains("port is already allocated"))
                        .unwrap_or(false);

                    if port_taken && attempt + 1 < MAX_PORT_RETRIES {
                        debug!(
                            "Port {} raced away for {}, retrying ({}/{})",
                            ssh_port,
                            name,
                            attempt + 1,
                            MAX_PORT_RETRIES
                        );
                        continue;
                    }
                    return Err(RuntimeError::Docker(e));
                }
            }
        }

        Err(RuntimeError::PortRangeExhausted(PORT_RANGE_START, PORT_RANGE_END))
    }

    async fn start_container(&self, project_id: Uuid) -> RuntimeResult<()> {
        let name = container_name(project_id);
        self.client
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                if Self::is_not_found(&e) {
                    RuntimeError::ContainerNotFound(name.clone())
                } else {
                    RuntimeError::Docker(e)
                }
            })?;
        Ok(())
    }

    async fn stop_container(&self, project_id: Uuid, timeout_secs: i64) -> RuntimeResult<()> {
        let name = container_name(project_id);
        self.client
            .stop_container(&name, Some(StopContainerOptions { t: timeout_secs }))
            .await
            .map_err(|e| {
                if Self::is_not_found(&e) {
                    RuntimeError::ContainerNotFound(name.clone())
                } else {
                    RuntimeError::Docker(e)
                }
            })?;
        info!("Stopped container {}", name);
        Ok(())
    }

    async fn delete_container(&self, project_id: Uuid) -> RuntimeResult<()> {
        let name = container_name(project_id);

        let options = RemoveContainerOptions {
            force: true,
            v: false,
            ..Default::default()
        };

        match self.client.remove_container(&name, Some(options)).await {
            Ok(_) => {
                debug!("Removed container {}", name);
                Ok(())
            }
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(RuntimeError::Docker(e)),
        }
    }

    async fn get_container_ip(&self, project_id: Uuid) -> RuntimeResult<String> {
        let name = container_name(project_id);
        let net = network_name(project_id);

        let info = self
            .client
            .inspect_container(&name, None)
            .await
            .map_err(|e| {
                if Self::is_not_found(&e) {
                    RuntimeError::ContainerNotFound(name.clone())
                } else {
                    RuntimeError::Docker(e)
                }
            })?;

        let running = info
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            return Err(RuntimeError::NotRunning(name));
        }

        let ip = info
            .network_settings
            .and_then(|s| s.networks)
            .and_then(|mut nets| nets.remove(&net))
            .and_then(|endpoint| endpoint.ip_address)
            .filter(|ip| !ip.is_empty());

        ip.ok_or(RuntimeError::NotAttached(net))
    }

    async fn connect_proxy_to_network(&self, project_id: Uuid) -> RuntimeResult<()> {
        let net = network_name(project_id);

        let options = ConnectNetworkOptions {
            container: PROXY_CONTAINER.to_string(),
            endpoint_config: EndpointSettings::default(),
        };

        match self.client.connect_network(&net, options).await {
            Ok(_) => {
                debug!("Connected {} to {}", PROXY_CONTAINER, net);
                Ok(())
            }
            Err(e) => {
                if let Some(msg) = Self::server_message(&e) {
                    if msg.to_lowercase().contains("already exists") {
                        return Ok(());
                    }
                }
                Err(RuntimeError::Docker(e))
            }
        }
    }

    async fn disconnect_proxy_from_network(&self, project_id: Uuid) -> RuntimeResult<()> {
        let net = network_name(project_id);

        let options = DisconnectNetworkOptions {
            container: PROXY_CONTAINER.to_string(),
            force: false,
        };

        match self.client.disconnect_network(&net, options).await {
            Ok(_) => {
                debug!("Disconnected {} from {}", PROXY_CONTAINER, net);
                Ok(())
            }
            // Network already gone
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => {
                if let Some(msg) = Self::server_message(&e) {
                    if msg.to_lowercase().contains("is not connected") {
                        return Ok(());
                    }
                }
                Err(RuntimeError::Docker(e))
            }
        }
    }

    async fn cleanup_project_resources(&self, project_id: Uuid) -> RuntimeResult<()> {
        self.delete_container(project_id).await?;
        self.delete_volume(project_id).await?;
        self.delete_network(project_id).await?;
        Ok(())
    }

    async fn exec(
        &self,
        project_id: Uuid,
        cmd: Vec<String>,
        user: &str,
    ) -> RuntimeResult<ExecOutput> {
        let name = container_name(project_id);

        let options = CreateExecOptions {
            cmd: Some(cmd),
            user: Some(user.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self.client.create_exec(&name, options).await?;

        let mut collected = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.client.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(log) => collected.push_str(&log.to_string()),
                    Err(e) => {
                        warn!("Error reading exec output: {}", e);
                        break;
                    }
                }
            }
        }

        let inspect = self.client.inspect_exec(&exec.id).await?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(0),
            output: collected,
        })
    }
}
