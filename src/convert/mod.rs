//! Converters turn an uploaded input into the bytes of an output artifact.
//!
//! The codecs themselves are out of scope; categories only see the
//! [`Converter`] trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};

use crate::config::ConverterKind;
use crate::supervisor::ProcessSupervisor;
use crate::utils::{ConvertdError, Result};

pub mod format;
pub mod note;
pub mod worker;

pub use format::FormatConverter;
pub use note::NoteConverter;
pub use worker::WorkerConverter;

/// A file received in a multipart upload
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub field_name: String,
    pub file_name: String,
    pub content_type: String,
    pub data: Bytes,
}

/// Everything a client sent for one conversion
#[derive(Debug, Clone, Default)]
pub struct ConversionInput {
    pub file: Option<UploadedFile>,
    pub fields: HashMap<String, String>,
}

impl ConversionInput {
    /// Non-blank value of a form or JSON field
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn require_file(&self) -> Result<&UploadedFile> {
        self.file
            .as_ref()
            .ok_or_else(|| ConvertdError::invalid_input("File is required"))
    }

    /// Bytes the input occupies, used against upload limits
    pub fn size(&self) -> u64 {
        let file = self.file.as_ref().map(|f| f.data.len()).unwrap_or(0);
        let fields: usize = self.fields.values().map(|v| v.len()).sum();
        (file + fields) as u64
    }
}

/// Produced artifact plus client-facing metadata
#[derive(Debug, Clone)]
pub struct ConversionOutput {
    pub file_name: String,
    pub data: Bytes,
    pub metadata: Map<String, Value>,
}

#[async_trait]
pub trait Converter: Send + Sync {
    fn name(&self) -> &str;

    async fn convert(&self, input: ConversionInput) -> Result<ConversionOutput>;
}

/// Builds the converter a category is configured with
pub fn build_converter(
    kind: &ConverterKind,
    supervisor: Option<&Arc<ProcessSupervisor>>,
) -> Result<Arc<dyn Converter>> {
    match kind {
        ConverterKind::Note => Ok(Arc::new(NoteConverter)),
        ConverterKind::Format => Ok(Arc::new(FormatConverter)),
        ConverterKind::Worker { endpoint } => {
            let supervisor = supervisor.ok_or_else(|| {
                ConvertdError::config("worker converter requires a configured worker")
            })?;
            Ok(Arc::new(WorkerConverter::new(
                Arc::clone(supervisor),
                endpoint.clone(),
            )))
        }
    }
}
