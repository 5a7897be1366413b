//! A tool category: its registry, converter and upload rules

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::{CategoryConfig, ConversionMode};
use crate::convert::{ConversionInput, Converter};
use crate::session::{SessionRegistry, release_artifacts};
use crate::store::{ArtifactKind, ArtifactRef, ArtifactStore};
use crate::utils::{ConvertdError, Result};

/// What the client gets back after submitting a conversion
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionReceipt {
    pub success: bool,
    pub session_id: String,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    pub expires_at: DateTime<Utc>,
    pub expires_in_seconds: i64,
    pub metadata: Map<String, Value>,
}

pub struct ToolCategory {
    config: CategoryConfig,
    registry: Arc<SessionRegistry>,
    converter: Arc<dyn Converter>,
    store: Arc<dyn ArtifactStore>,
}

impl ToolCategory {
    pub fn new(
        config: CategoryConfig,
        registry: Arc<SessionRegistry>,
        converter: Arc<dyn Converter>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            config,
            registry,
            converter,
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CategoryConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Enforces the category's size limit and accepted content types
    pub fn check_input(&self, input: &ConversionInput) -> Result<()> {
        let size = input.size();
        if size > self.config.max_upload_bytes {
            return Err(ConvertdError::too_large(size, self.config.max_upload_bytes));
        }
        if let Some(file) = &input.file {
            if !self.config.accepts_content_type(&file.content_type) {
                return Err(ConvertdError::invalid_input(format!(
                    "Unsupported file type: {}",
                    file.content_type
                )));
            }
        }
        Ok(())
    }

    /// Validates and stores the input, then converts it now or in the
    /// background depending on the category mode.
    pub async fn submit(&self, input: ConversionInput) -> Result<ConversionReceipt> {
        self.check_input(&input)?;

        let stored_input = match &input.file {
            Some(file) => Some(
                self.store
                    .put(ArtifactKind::Input, &file.file_name, file.data.clone())
                    .await?,
            ),
            None => None,
        };

        match self.config.mode {
            ConversionMode::Sync => self.convert_now(input, stored_input).await,
            ConversionMode::Deferred => Ok(self.convert_later(input, stored_input).await),
        }
    }

    async fn convert_now(
        &self,
        input: ConversionInput,
        stored_input: Option<ArtifactRef>,
    ) -> Result<ConversionReceipt> {
        let output = match self.converter.convert(input).await {
            Ok(output) => output,
            Err(e) => {
                self.discard(stored_input).await;
                return Err(e);
            }
        };

        let artifact = match self
            .store
            .put(ArtifactKind::Output, &output.file_name, output.data)
            .await
        {
            Ok(artifact) => artifact,
            Err(e) => {
                self.discard(stored_input).await;
                return Err(e);
            }
        };

        let session = self
            .registry
            .create(stored_input, Some(artifact), output.metadata)
            .await;

        info!(
            session_id = %session.id,
            category = %self.config.name,
            converter = %self.converter.name(),
            "Conversion completed"
        );

        let now = self.registry.now();
        Ok(ConversionReceipt {
            success: true,
            ready: true,
            file_name: session.output.as_ref().map(|o| o.file_name.clone()),
            file_size: session.output.as_ref().map(|o| o.size),
            expires_at: session.expires_at,
            expires_in_seconds: session.expires_in_seconds(now),
            metadata: session.metadata,
            session_id: session.id,
        })
    }

    async fn convert_later(
        &self,
        input: ConversionInput,
        stored_input: Option<ArtifactRef>,
    ) -> ConversionReceipt {
        let session = self.registry.create(stored_input, None, Map::new()).await;

        let registry = Arc::clone(&self.registry);
        let converter = Arc::clone(&self.converter);
        let store = Arc::clone(&self.store);
        let session_id = session.id.clone();

        tokio::spawn(async move {
            let output = match converter.convert(input).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Deferred conversion failed");
                    record_failure(&registry, &session_id, e.client_message()).await;
                    return;
                }
            };

            let artifact = match store
                .put(ArtifactKind::Output, &output.file_name, output.data)
                .await
            {
                Ok(artifact) => artifact,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Failed to store deferred output");
                    record_failure(&registry, &session_id, e.client_message()).await;
                    return;
                }
            };

            match registry
                .complete(&session_id, artifact.clone(), output.metadata)
                .await
            {
                Ok(_) => info!(session_id = %session_id, "Deferred conversion completed"),
                Err(e) => {
                    // The session expired while converting, nobody else owns this output
                    warn!(session_id = %session_id, error = %e, "Discarding orphaned output");
                    release_artifacts(store.as_ref(), &session_id, &[artifact]).await;
                }
            }
        });

        info!(
            session_id = %session.id,
            category = %self.config.name,
            "Conversion accepted"
        );

        let now = self.registry.now();
        ConversionReceipt {
            success: true,
            ready: false,
            file_name: None,
            file_size: None,
            expires_at: session.expires_at,
            expires_in_seconds: session.expires_in_seconds(now),
            metadata: session.metadata,
            session_id: session.id,
        }
    }

    async fn discard(&self, stored_input: Option<ArtifactRef>) {
        if let Some(artifact) = stored_input {
            release_artifacts(self.store.as_ref(), "unregistered", &[artifact]).await;
        }
    }
}

impl std::fmt::Debug for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCategory")
            .field("name", &self.config.name)
            .field("mode", &self.config.mode)
            .field("converter", &self.converter.name())
            .finish_non_exhaustive()
    }
}

/// Marks a deferred session failed. Returns `false` when the session was
/// reclaimed before the failure could be recorded.
async fn record_failure(registry: &SessionRegistry, session_id: &str, message: String) -> bool {
    match registry.fail(session_id, message).await {
        Ok(_) => true,
        Err(e) => {
            debug!(session_id = %session_id, error = %e, "Dropping failure of orphaned session");
            false
        }
    }
}
