use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};

use crate::convert::{ConversionInput, ConversionOutput, Converter};
use crate::store::sanitize_file_name;
use crate::utils::{ConvertdError, Result};

pub const DEFAULT_NOTE_TITLE: &str = "Quick Note";

/// Saves text content as a downloadable `.txt` note
#[derive(Debug, Default, Clone, Copy)]
pub struct NoteConverter;

#[async_trait]
impl Converter for NoteConverter {
    fn name(&self) -> &str {
        "note"
    }

    async fn convert(&self, input: ConversionInput) -> Result<ConversionOutput> {
        let content = input
            .fields
            .get("content")
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ConvertdError::invalid_input("Note content is required"))?;
        let title = input.field("title").unwrap_or(DEFAULT_NOTE_TITLE);

        let mut metadata = Map::new();
        metadata.insert("title".to_string(), Value::from(title));
        metadata.insert(
            "wordCount".to_string(),
            Value::from(content.split_whitespace().count()),
        );

        Ok(ConversionOutput {
            file_name: format!("{}.txt", sanitize_file_name(title)),
            data: Bytes::from(content.clone()),
            metadata,
        })
    }
}
