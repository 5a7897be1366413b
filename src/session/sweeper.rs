//! Periodic reclamation of expired sessions
//!
//! The sweeper scans every registry on a fixed interval, independent of the
//! TTLs. Sessions nobody downloaded are claimed and their artifacts deleted.
//! The download gateway enforces expiry on its own at read time, so the sweeper
//! lagging by up to one interval only delays disk cleanup.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::session::reclaim::{ReclaimReport, reclaim_session};
use crate::session::registry::SessionRegistry;
use crate::store::ArtifactStore;

/// Default sweep interval (1 minute)
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Reclaims expired sessions across all registries
#[derive(Clone)]
pub struct Sweeper {
    registries: Vec<Arc<SessionRegistry>>,
    store: Arc<dyn ArtifactStore>,
}

impl Sweeper {
    pub fn new(registries: Vec<Arc<SessionRegistry>>, store: Arc<dyn ArtifactStore>) -> Self {
        Self { registries, store }
    }

    /// Runs one sweep over every registry.
    ///
    /// Never fails: delete errors are logged and the sweep moves on.
    pub async fn run(&self) -> SweepResult {
        let mut result = SweepResult::default();

        for registry in &self.registries {
            let now = registry.now();
            result.sessions_scanned += registry.len().await;

            for id in registry.expired_ids(now).await {
                // Gateway may have claimed it since the scan
                if let Some(report) = reclaim_session(registry, self.store.as_ref(), &id).await {
                    debug!(
                        session_id = %id,
                        category = %registry.category(),
                        "Reclaimed expired session"
                    );
                    result.record(report);
                }
            }
        }

        if result.sessions_reclaimed > 0 || result.delete_failures > 0 {
            info!(
                sessions_scanned = result.sessions_scanned,
                sessions_reclaimed = result.sessions_reclaimed,
                artifacts_deleted = result.artifacts_deleted,
                delete_failures = result.delete_failures,
                "Session sweep complete"
            );
        } else {
            debug!(
                sessions_scanned = result.sessions_scanned,
                "Session sweep complete, nothing expired"
            );
        }

        result
    }

    /// Reclaims every session regardless of expiry. Used on shutdown, since
    /// sessions do not survive the process.
    pub async fn purge_all(&self) -> SweepResult {
        let mut result = SweepResult::default();

        for registry in &self.registries {
            let ids = registry.ids().await;
            result.sessions_scanned += ids.len();

            for id in ids {
                if let Some(report) = reclaim_session(registry, self.store.as_ref(), &id).await {
                    result.record(report);
                }
            }
        }

        info!(
            sessions_reclaimed = result.sessions_reclaimed,
            artifacts_deleted = result.artifacts_deleted,
            delete_failures = result.delete_failures,
            "Purged all sessions"
        );
        result
    }

    /// Starts the background sweep task.
    ///
    /// Returns a JoinHandle for graceful shutdown coordination and a shutdown sender
    pub fn start_sweep_task(&self, every: Duration) -> (JoinHandle<()>, mpsc::Sender<()>) {
        let sweeper = self.clone();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let result = sweeper.run().await;
                        if result.delete_failures > 0 {
                            error!(
                                delete_failures = result.delete_failures,
                                "Some artifacts could not be deleted during sweep"
                            );
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Sweep task received shutdown signal, stopping...");
                        break;
                    }
                }
            }
        });

        (handle, shutdown_tx)
    }
}

/// Result of a sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepResult {
    /// Sessions present when the sweep looked at each registry
    pub sessions_scanned: usize,
    /// Sessions this sweep claimed
    pub sessions_reclaimed: usize,
    pub artifacts_deleted: usize,
    pub delete_failures: usize,
}

impl SweepResult {
    fn record(&mut self, report: ReclaimReport) {
        self.sessions_reclaimed += 1;
        self.artifacts_deleted += report.deleted;
        self.delete_failures += report.failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::clock::ManualClock;
    use crate::store::{ArtifactKind, LocalArtifactStore};
    use bytes::Bytes;
    use chrono::Duration as ChronoDuration;
    use serde_json::Map;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<LocalArtifactStore>, Arc<ManualClock>, Arc<SessionRegistry>) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(LocalArtifactStore::new(temp_dir.path().to_path_buf()));
        store.initialize().await.unwrap();
        let clock = Arc::new(ManualClock::default());
        let registry = Arc::new(SessionRegistry::new(
            "file-tools",
            Duration::from_secs(240),
            clock.clone(),
        ));
        (temp_dir, store, clock, registry)
    }

    #[tokio::test]
    async fn test_run_reclaims_only_expired() {
        let (_temp_dir, store, clock, registry) = setup().await;
        let sweeper = Sweeper::new(vec![registry.clone()], store.clone());

        let old_output = store
            .put(ArtifactKind::Output, "old.txt", Bytes::from_static(b"old"))
            .await
            .unwrap();
        let old = registry.create(None, Some(old_output.clone()), Map::new()).await;

        clock.advance(ChronoDuration::minutes(2));
        let fresh_output = store
            .put(ArtifactKind::Output, "fresh.txt", Bytes::from_static(b"fresh"))
            .await
            .unwrap();
        let fresh = registry.create(None, Some(fresh_output.clone()), Map::new()).await;

        clock.advance(ChronoDuration::minutes(3));
        let result = sweeper.run().await;

        assert_eq!(result.sessions_scanned, 2);
        assert_eq!(result.sessions_reclaimed, 1);
        assert_eq!(result.artifacts_deleted, 1);
        assert!(registry.get(&old.id).await.is_none());
        assert!(registry.get(&fresh.id).await.is_some());
        assert!(!store.exists(&old_output).await.unwrap());
        assert!(store.exists(&fresh_output).await.unwrap());
    }

    #[tokio::test]
    async fn test_session_without_artifacts_is_dropped() {
        let (_temp_dir, store, clock, registry) = setup().await;
        let sweeper = Sweeper::new(vec![registry.clone()], store);

        registry.create(None, None, Map::new()).await;
        clock.advance(ChronoDuration::minutes(5));

        let result = sweeper.run().await;
        assert_eq!(result.sessions_reclaimed, 1);
        assert_eq!(result.artifacts_deleted, 0);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_run_tolerates_missing_files() {
        let (_temp_dir, store, clock, registry) = setup().await;
        let sweeper = Sweeper::new(vec![registry.clone()], store.clone());

        let output = store
            .put(ArtifactKind::Output, "out.txt", Bytes::from_static(b"x"))
            .await
            .unwrap();
        registry.create(None, Some(output.clone()), Map::new()).await;
        store.delete_if_exists(&output).await.unwrap();

        clock.advance(ChronoDuration::minutes(5));
        let result = sweeper.run().await;
        assert_eq!(result.sessions_reclaimed, 1);
        assert_eq!(result.delete_failures, 0);
    }

    #[tokio::test]
    async fn test_purge_all() {
        let (_temp_dir, store, _clock, registry) = setup().await;
        let sweeper = Sweeper::new(vec![registry.clone()], store.clone());

        for i in 0..3 {
            let output = store
                .put(ArtifactKind::Output, &format!("{}.txt", i), Bytes::from_static(b"x"))
                .await
                .unwrap();
            registry.create(None, Some(output), Map::new()).await;
        }

        let result = sweeper.purge_all().await;
        assert_eq!(result.sessions_reclaimed, 3);
        assert_eq!(result.artifacts_deleted, 3);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_start_sweep_task() {
        let (_temp_dir, store, _clock, registry) = setup().await;
        let sweeper = Sweeper::new(vec![registry], store);

        let (handle, shutdown) = sweeper.start_sweep_task(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(120)).await;
        let _ = shutdown.send(()).await;

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(result.is_ok(), "Sweep task should complete within timeout");
    }
}
