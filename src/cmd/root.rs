//! Main daemon command - starts the orchestrator

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sandbox_daemon::auth::AuthVerifier;
use sandbox_daemon::cloud::{GcsIam, ObjectStorageIam};
use sandbox_daemon::config::Configuration;
use sandbox_daemon::db::{PgStore, Store};
use sandbox_daemon::docker::{ContainerRuntime, DockerRuntime};
use sandbox_daemon::gateway::TerminalGateway;
use sandbox_daemon::lifecycle::LifecycleController;
use sandbox_daemon::reconciler::Reconciler;
use sandbox_daemon::registry::{DockerImageRegistry, ImageRegistry};
use sandbox_daemon::router::{self, AppState};
use sandbox_daemon::snapshot::SnapshotEngine;
use sandbox_daemon::tenant::TenantProvisioner;

/// Run the daemon
pub async fn run() -> Result<()> {
    let config = Arc::new(Configuration::from_env());

    info!("Starting sandbox daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("  API port: {}", config.network.api_port);
    info!("  Terminal gateway port: {}", config.network.terminal_proxy_port);
    info!("  Base image: {}", config.sandbox.base_image);
    info!("  Registry: {}", config.sandbox.registry_root);

    // Persistence
    let store = PgStore::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    store.ensure_schema().await.context("Failed to ensure schema")?;
    let store: Arc<dyn Store> = Arc::new(store);

    // External adapters
    let docker = bollard::Docker::connect_with_local_defaults()
        .context("Failed to connect to Docker daemon")?;
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::with_client(docker.clone()));
    let storage: Arc<dyn ObjectStorageIam> = Arc::new(
        GcsIam::from_key_file(
            &config.tenant.credentials_path,
            &config.tenant.gcp_project,
            &config.tenant.region,
        )
        .context("Failed to load cloud credentials")?,
    );
    let registry: Arc<dyn ImageRegistry> = Arc::new(DockerImageRegistry::new(
        docker,
        &config.sandbox.registry_root,
        &config.tenant.credentials_path,
    )?);

    // Core components
    let snapshots = SnapshotEngine::new(
        runtime.clone(),
        registry.clone(),
        &config.sandbox.registry_root,
        &config.tenant.credentials_path,
    );
    let provisioner =
        TenantProvisioner::new(store.clone(), storage.clone(), &config.tenant.gcp_project);
    let controller = Arc::new(LifecycleController::new(
        store.clone(),
        runtime.clone(),
        storage.clone(),
        registry.clone(),
        snapshots,
        provisioner,
        config.clone(),
    ));
    let auth = Arc::new(AuthVerifier::new(&config.auth.jwt_secret, store.clone()));

    let shutdown = CancellationToken::new();

    // Reconciler: recover stuck projects once at startup, then loop
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        controller.clone(),
        config.reconciler.clone(),
    ));
    if let Err(e) = reconciler.recover_stuck().await {
        warn!("Startup stuck recovery failed: {}", e);
    }
    let reconciler_task = reconciler.spawn(shutdown.clone());

    // Terminal gateway
    let gateway = Arc::new(TerminalGateway::new(runtime.clone(), &config));
    let gateway_addr: SocketAddr = format!("0.0.0.0:{}", config.network.terminal_proxy_port)
        .parse()
        .expect("Invalid gateway bind address");
    let gateway_listener = tokio::net::TcpListener::bind(gateway_addr)
        .await
        .context("Failed to bind terminal gateway port")?;
    let gateway_task = tokio::spawn(gateway.serve(gateway_listener, shutdown.clone()));

    // HTTP API
    let state = AppState {
        controller,
        auth,
        config: config.clone(),
    };
    let app = router::build_router(state);

    let api_addr: SocketAddr = format!("0.0.0.0:{}", config.network.api_port)
        .parse()
        .expect("Invalid API bind address");
    let api_listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .context("Failed to bind API port")?;
    info!("API listening on {}", api_addr);

    // Graceful shutdown: ctrl-c cancels background tasks, then the server
    // drains. Long-running operations already in flight (snapshot pushes)
    // finish under their own locks.
    let shutdown_signal = shutdown.clone();
    axum::serve(api_listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install CTRL+C handler");
            warn!("Received shutdown signal");
            shutdown_signal.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = reconciler_task.await;
    let _ = gateway_task.await;

    info!("Daemon stopped");
    Ok(())
}
