//! Reconciler
//!
//! Single background loop that keeps the project fleet honest: projects
//! stuck in a transitional status after a crash are reset to `error`, and
//! running projects nobody has connected to for a while are snapshotted
//! and stopped. One bad project never halts the loop.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ReconcilerConfiguration;
use crate::db::{ProjectStatus, Store};
use crate::lifecycle::LifecycleController;

/// Reconciler
pub struct Reconciler {
    store: Arc<dyn Store>,
    controller: Arc<LifecycleController>,
    config: ReconcilerConfiguration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        controller: Arc<LifecycleController>,
        config: ReconcilerConfiguration,
    ) -> Self {
        Self {
            store,
            controller,
            config,
        }
    }

    /// Spawn the reconciliation loop. Cancelling the token aborts the
    /// pending sleep and exits the loop.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.check_interval);
            interval.tick().await; // Skip the immediate first tick

            info!(
                "Reconciler started (interval {:?}, idle {:?}, stuck {:?})",
                self.config.check_interval, self.config.idle_threshold, self.config.stuck_threshold
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Reconciler stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        self.tick().await;
                    }
                }
            }
        })
    }

    /// One reconciliation pass.
    pub async fn tick(&self) {
        if let Err(e) = self.recover_stuck().await {
            error!("Stuck recovery error: {}", e);
        }
        self.auto_snapshot_idle().await;
    }

    /// Reset projects stuck in a transitional status. Without this, a
    /// process crash would leave `creating`/`snapshotting`/`restoring`
    /// rows in limbo forever.
    pub async fn recover_stuck(&self) -> Result<(), crate::db::StoreError> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.stuck_threshold).unwrap_or_default();

        let stuck = self.store.stuck_projects(cutoff).await?;
        for project in &stuck {
            warn!(
                "Recovering stuck project {} (status={}, last_active={}) -> error",
                project.id, project.status, project.last_active_at
            );
            self.store
                .update_status(project.id, ProjectStatus::Error)
                .await?;
        }

        if !stuck.is_empty() {
            info!("Recovered {} stuck project(s)", stuck.len());
        }
        Ok(())
    }

    /// Snapshot running projects whose last terminal connection is older
    /// than the idle threshold.
    pub async fn auto_snapshot_idle(&self) {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.idle_threshold).unwrap_or_default();

        let idle = match self
            .store
            .idle_projects(cutoff, self.config.idle_when_never_connected)
            .await
        {
            Ok(idle) => idle,
            Err(e) => {
                error!("Idle query error: {}", e);
                return;
            }
        };

        for project in idle {
            info!(
                "Auto-snapshotting idle project {} (last connection: {:?})",
                project.id, project.last_connection_at
            );
            if let Err(e) = self.controller.auto_snapshot(project.id).await {
                error!("Auto-snapshot failed for {}: {}", project.id, e);
            }
        }
    }
}
