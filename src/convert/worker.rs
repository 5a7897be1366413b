use std::sync::Arc;

use async_trait::async_trait;

use crate::convert::{ConversionInput, ConversionOutput, Converter};
use crate::supervisor::ProcessSupervisor;
use crate::utils::Result;

/// Delegates conversion to the supervised worker process
pub struct WorkerConverter {
    supervisor: Arc<ProcessSupervisor>,
    endpoint: String,
}

impl WorkerConverter {
    pub fn new(supervisor: Arc<ProcessSupervisor>, endpoint: impl Into<String>) -> Self {
        Self {
            supervisor,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Converter for WorkerConverter {
    fn name(&self) -> &str {
        "worker"
    }

    async fn convert(&self, input: ConversionInput) -> Result<ConversionOutput> {
        self.supervisor
            .forward_conversion(&self.endpoint, input)
            .await
    }
}
