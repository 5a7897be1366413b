//! Releasing the artifacts of a claimed session
//!
//! Reclaiming is always remove-then-release: the registry entry is claimed
//! first and only the caller that won the claim deletes the files, so the
//! sweeper and the download gateway never release the same artifact twice.

use std::ops::AddAssign;

use tracing::{debug, warn};

use crate::session::registry::SessionRegistry;
use crate::store::{ArtifactRef, ArtifactStore};

/// Outcome of releasing a set of artifacts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimReport {
    pub deleted: usize,
    /// Already gone before we got to them
    pub missing: usize,
    pub failed: usize,
}

impl AddAssign for ReclaimReport {
    fn add_assign(&mut self, other: Self) {
        self.deleted += other.deleted;
        self.missing += other.missing;
        self.failed += other.failed;
    }
}

/// Best-effort deletion of `artifacts`. Failures are logged and counted, never
/// returned.
pub async fn release_artifacts(
    store: &dyn ArtifactStore,
    session_id: &str,
    artifacts: &[ArtifactRef],
) -> ReclaimReport {
    let mut report = ReclaimReport::default();

    for artifact in artifacts {
        match store.delete_if_exists(artifact).await {
            Ok(true) => report.deleted += 1,
            Ok(false) => report.missing += 1,
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    key = %artifact.key,
                    error = %e,
                    "Failed to delete artifact"
                );
                report.failed += 1;
            }
        }
    }

    report
}

/// Claims session `id` and releases its artifacts.
///
/// Returns `None` when someone else already claimed it.
pub async fn reclaim_session(
    registry: &SessionRegistry,
    store: &dyn ArtifactStore,
    id: &str,
) -> Option<ReclaimReport> {
    let session = registry.remove(id).await?;
    let report = release_artifacts(store, &session.id, &session.artifacts()).await;

    debug!(
        session_id = %session.id,
        category = %session.category,
        deleted = report.deleted,
        failed = report.failed,
        "Session reclaimed"
    );
    Some(report)
}
