//! Per-project operation locks
//!
//! Every lifecycle operation on a project runs under that project's lock,
//! so overlapping operations serialize while operations on different
//! projects proceed in parallel. The reconciler shares the same registry,
//! making its actions mutually exclusive with controller actions.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Registry of per-project mutexes.
///
/// Entries are created on first use and kept for the process lifetime;
/// the registry is bounded by the number of projects this host has seen.
#[derive(Default)]
pub struct ProjectLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive lock for a project, waiting if another
    /// operation holds it.
    pub async fn lock(&self, project_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(project_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Whether the project's lock is currently held.
    pub fn is_locked(&self, project_id: Uuid) -> bool {
        self.locks
            .get(&project_id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_project_serializes() {
        let locks = Arc::new(ProjectLocks::new());
        let id = Uuid::new_v4();

        let guard = locks.lock(id).await;
        assert!(locks.is_locked(id));

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(id).await;
            })
        };

        // The contender cannot finish while the guard is held
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
        assert!(!locks.is_locked(id));
    }

    #[tokio::test]
    async fn different_projects_do_not_contend() {
        let locks = ProjectLocks::new();
        let _a = locks.lock(Uuid::new_v4()).await;
        // Acquiring a different project's lock completes immediately
        let _b = locks.lock(Uuid::new_v4()).await;
    }
}
