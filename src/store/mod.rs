//! Artifact storage
//!
//! Sessions never touch the filesystem directly. They hold [`ArtifactRef`]s and
//! go through an [`ArtifactStore`] to write, stream and delete the bytes.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::utils::Result;

pub mod local;

pub use local::LocalArtifactStore;

/// Longest file name kept after sanitizing
pub const MAX_FILE_NAME_LEN: usize = 128;

/// Which side of a conversion an artifact belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Input,
    Output,
}

impl ArtifactKind {
    /// Subdirectory (or key prefix) the kind is stored under
    pub fn dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::Input => "uploads",
            ArtifactKind::Output => "processed",
        }
    }
}

/// Reference to a stored blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Store-relative key, e.g. `processed/<uuid>_report.pdf`
    pub key: String,
    pub kind: ArtifactKind,
    /// Sanitized name presented to clients
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
}

/// Byte stream of an opened artifact
pub type ArtifactStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Backend that owns artifact bytes
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persists `data` and returns a reference to it
    async fn put(&self, kind: ArtifactKind, file_name: &str, data: Bytes) -> Result<ArtifactRef>;

    /// Opens the artifact for streaming
    async fn open(&self, artifact: &ArtifactRef) -> Result<ArtifactStream>;

    /// Deletes the artifact; `Ok(false)` if it was already gone
    async fn delete_if_exists(&self, artifact: &ArtifactRef) -> Result<bool>;

    async fn exists(&self, artifact: &ArtifactRef) -> Result<bool>;
}

/// Maps a file extension to the content type served on download
pub fn content_type_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "txt" => "text/plain",
        "rtf" => "application/rtf",
        "json" => "application/json",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "tiff" | "tif" => "image/tiff",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

/// Reduces a client-supplied name to something safe as a path component and
/// inside a quoted `Content-Disposition` value.
pub fn sanitize_file_name(name: &str) -> String {
    // Browsers may send full client paths
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = cleaned.trim_start_matches('.');
    let mut result: String = if trimmed.len() > MAX_FILE_NAME_LEN {
        // Keep the extension when truncating
        match trimmed.rsplit_once('.') {
            Some((stem, ext)) if ext.len() < 16 => {
                let keep = MAX_FILE_NAME_LEN.saturating_sub(ext.len() + 1);
                format!("{}.{}", &stem[..keep.min(stem.len())], ext)
            }
            _ => trimmed[..MAX_FILE_NAME_LEN].to_string(),
        }
    } else {
        trimmed.to_string()
    };

    if result.is_empty() || result.chars().all(|c| c == '_') {
        result = "file".to_string();
    }
    result
}

/// Extension of a file name, lowercased and without the dot
pub fn extension_of(file_name: &str) -> Option<String> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// File name without its extension
pub fn stem_of(file_name: &str) -> &str {
    match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file_name,
    }
}
