use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};

use crate::convert::{ConversionInput, ConversionOutput, Converter};
use crate::store::{extension_of, sanitize_file_name, stem_of};
use crate::utils::{ConvertdError, Result};

/// Re-labels a file under a requested format.
///
/// Text targets are re-emitted as UTF-8; every other target passes the bytes
/// through under the new extension. Real codecs plug in as their own
/// [`Converter`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FormatConverter;

#[async_trait]
impl Converter for FormatConverter {
    fn name(&self) -> &str {
        "format"
    }

    async fn convert(&self, input: ConversionInput) -> Result<ConversionOutput> {
        let target = input
            .field("targetFormat")
            .ok_or_else(|| ConvertdError::invalid_input("Target format is required"))?
            .trim_start_matches('.')
            .to_ascii_lowercase();
        if target.is_empty() || !target.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConvertdError::invalid_input(format!(
                "Unsupported target format: {}",
                target
            )));
        }

        let file = input.require_file()?;
        let original_name = sanitize_file_name(&file.file_name);
        let source = extension_of(&original_name).unwrap_or_default();

        let data = if target == "txt" {
            let text = std::str::from_utf8(&file.data).map_err(|_| {
                ConvertdError::invalid_input("File is not valid UTF-8 text and cannot become txt")
            })?;
            Bytes::from(text.to_owned())
        } else {
            file.data.clone()
        };

        let mut metadata = Map::new();
        metadata.insert("sourceFormat".to_string(), Value::from(source));
        metadata.insert("targetFormat".to_string(), Value::from(target.clone()));
        metadata.insert("originalSize".to_string(), Value::from(file.data.len()));
        metadata.insert("convertedSize".to_string(), Value::from(data.len()));

        Ok(ConversionOutput {
            file_name: format!("converted_{}.{}", stem_of(&original_name), target),
            data,
            metadata,
        })
    }
}
