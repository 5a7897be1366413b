//! Single-use downloads of session outputs
//!
//! A download claims its session from the registry before streaming, so a
//! second attempt finds nothing. The artifacts are deleted once the body stream
//! ends, fails or is dropped by a disconnecting client.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::session::{SessionRegistry, reclaim_session, release_artifacts};
use crate::store::{ArtifactRef, ArtifactStore, ArtifactStream};
use crate::utils::{ConvertdError, Result};

pub struct DownloadGateway {
    store: Arc<dyn ArtifactStore>,
    cleanup_delay: Duration,
}

/// A claimed output ready to be streamed
pub struct Download {
    pub session_id: String,
    pub artifact: ArtifactRef,
    pub body: ArtifactStream,
}

impl Download {
    pub fn content_disposition(&self) -> String {
        format!("attachment; filename=\"{}\"", self.artifact.file_name)
    }
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("session_id", &self.session_id)
            .field("artifact", &self.artifact)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: String,
    pub ready: bool,
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub expires_in_seconds: i64,
    pub expires_at: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

impl DownloadGateway {
    pub fn new(store: Arc<dyn ArtifactStore>, cleanup_delay: Duration) -> Self {
        Self {
            store,
            cleanup_delay,
        }
    }

    /// Claims session `id` and opens its output for streaming.
    ///
    /// Expiry is checked here against the registry clock, so an expired
    /// session is refused even if the sweeper has not run yet.
    pub async fn download(&self, registry: &SessionRegistry, id: &str) -> Result<Download> {
        let session = registry
            .get(id)
            .await
            .ok_or_else(|| ConvertdError::not_found(id))?;

        if session.is_expired_at(registry.now()) {
            reclaim_session(registry, self.store.as_ref(), id).await;
            info!(session_id = %id, category = %registry.category(), "Download refused, session expired");
            return Err(ConvertdError::expired(id));
        }
        if let Some(message) = &session.failure {
            return Err(ConvertdError::conversion(message.clone()));
        }
        if !session.is_ready() {
            return Err(ConvertdError::not_ready(id));
        }

        // Losing this race means another download got there first
        let session = registry
            .remove(id)
            .await
            .ok_or_else(|| ConvertdError::not_found(id))?;
        let guard = CleanupGuard::new(
            Arc::clone(&self.store),
            session.id.clone(),
            session.artifacts(),
            self.cleanup_delay,
        );

        let Some(artifact) = session.output.clone() else {
            return Err(ConvertdError::not_ready(id));
        };

        let inner = match self.store.open(&artifact).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(session_id = %id, error = %e, "Failed to open artifact for download");
                return Err(e);
            }
        };

        info!(
            session_id = %id,
            category = %registry.category(),
            size = artifact.size,
            "Streaming download"
        );

        Ok(Download {
            session_id: session.id,
            artifact,
            body: Box::pin(CleanupOnComplete {
                inner,
                guard: Some(guard),
            }),
        })
    }

    /// Reports whether session `id` is ready, failed or still pending
    pub async fn status(&self, registry: &SessionRegistry, id: &str) -> Result<SessionStatus> {
        let session = registry
            .get(id)
            .await
            .ok_or_else(|| ConvertdError::not_found(id))?;

        let now = registry.now();
        if session.is_expired_at(now) {
            reclaim_session(registry, self.store.as_ref(), id).await;
            return Err(ConvertdError::expired(id));
        }

        Ok(SessionStatus {
            ready: session.is_ready(),
            failed: session.is_failed(),
            error: session.failure.clone(),
            file_name: session.output.as_ref().map(|o| o.file_name.clone()),
            expires_in_seconds: session.expires_in_seconds(now),
            expires_at: session.expires_at,
            metadata: session.metadata,
            session_id: session.id,
        })
    }
}

/// Deletes a claimed session's artifacts when dropped
struct CleanupGuard {
    store: Arc<dyn ArtifactStore>,
    session_id: String,
    artifacts: Vec<ArtifactRef>,
    delay: Duration,
    outcome: &'static str,
}

impl CleanupGuard {
    fn new(
        store: Arc<dyn ArtifactStore>,
        session_id: String,
        artifacts: Vec<ArtifactRef>,
        delay: Duration,
    ) -> Self {
        Self {
            store,
            session_id,
            artifacts,
            delay,
            outcome: "aborted",
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                session_id = %self.session_id,
                "No runtime to delete downloaded artifacts, leaving them for the next startup"
            );
            return;
        };

        let store = Arc::clone(&self.store);
        let session_id = std::mem::take(&mut self.session_id);
        let artifacts = std::mem::take(&mut self.artifacts);
        let delay = self.delay;
        let outcome = self.outcome;

        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let report = release_artifacts(store.as_ref(), &session_id, &artifacts).await;
            debug!(
                session_id = %session_id,
                outcome = outcome,
                deleted = report.deleted,
                failed = report.failed,
                "Released downloaded session"
            );
        });
    }
}

/// Passes the artifact stream through and triggers cleanup at its end
struct CleanupOnComplete {
    inner: ArtifactStream,
    guard: Option<CleanupGuard>,
}

impl Stream for CleanupOnComplete {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = self.inner.as_mut().poll_next(cx);
        match &poll {
            Poll::Ready(None) => self.finish("completed"),
            Poll::Ready(Some(Err(_))) => self.finish("failed"),
            _ => {}
        }
        poll
    }
}

impl CleanupOnComplete {
    fn finish(&mut self, outcome: &'static str) {
        if let Some(mut guard) = self.guard.take() {
            guard.outcome = outcome;
        }
    }
}
