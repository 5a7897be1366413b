use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{
    ArtifactKind, ArtifactRef, ArtifactStore, ArtifactStream, content_type_for,
    sanitize_file_name,
};
use crate::utils::fs::{file_exists, remove_if_exists, set_owner_only};
use crate::utils::{ConvertdError, Result};

/// Filesystem-backed artifact store
///
/// Layout: `<root>/uploads/<uuid>_<name>` for inputs and
/// `<root>/processed/<uuid>_<name>` for outputs.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the root and the per-kind directories
    pub async fn initialize(&self) -> Result<()> {
        for kind in [ArtifactKind::Input, ArtifactKind::Output] {
            let dir = self.root.join(kind.dir_name());
            if !file_exists(&dir)
                .await
                .map_err(|e| ConvertdError::io(&dir, e))?
            {
                fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| ConvertdError::io(&dir, e))?;

                // Set directory permissions to 0755 on Unix
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let permissions = std::fs::Permissions::from_mode(0o755);
                    fs::set_permissions(&dir, permissions)
                        .await
                        .map_err(|e| ConvertdError::io(&dir, e))?;
                }

                info!("Created artifact directory: {:?}", dir);
            }
        }
        Ok(())
    }

    /// Deletes every file left in the artifact directories.
    ///
    /// Sessions live in memory only, so anything on disk at startup belongs to
    /// a previous process and can never be downloaded.
    pub async fn remove_stale(&self) -> Result<usize> {
        let mut removed = 0;

        for kind in [ArtifactKind::Input, ArtifactKind::Output] {
            let dir = self.root.join(kind.dir_name());
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(ConvertdError::io(&dir, e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| ConvertdError::io(&dir, e))?
            {
                let path = entry.path();
                let is_file = entry
                    .file_type()
                    .await
                    .map(|t| t.is_file())
                    .unwrap_or(false);
                if !is_file {
                    continue;
                }

                match remove_if_exists(&path).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => warn!("Failed to remove stale artifact {:?}: {}", path, e),
                }
            }
        }

        if removed > 0 {
            info!(removed = removed, "Removed stale artifacts from previous run");
        }
        Ok(removed)
    }

    /// Resolves a key to a path under the root, refusing anything that could
    /// escape it.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(ConvertdError::invalid_input(format!(
                "invalid artifact key: {}",
                key
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, kind: ArtifactKind, file_name: &str, data: Bytes) -> Result<ArtifactRef> {
        let file_name = sanitize_file_name(file_name);
        let key = format!("{}/{}_{}", kind.dir_name(), Uuid::new_v4(), file_name);
        let path = self.resolve(&key)?;

        fs::write(&path, &data)
            .await
            .map_err(|e| ConvertdError::io(&path, e))?;
        set_owner_only(&path)
            .await
            .map_err(|e| ConvertdError::io(&path, e))?;

        debug!(key = %key, size = data.len(), "Stored artifact");

        Ok(ArtifactRef {
            content_type: content_type_for(&file_name).to_string(),
            key,
            kind,
            file_name,
            size: data.len() as u64,
        })
    }

    async fn open(&self, artifact: &ArtifactRef) -> Result<ArtifactStream> {
        let path = self.resolve(&artifact.key)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| ConvertdError::io(&path, e))?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn delete_if_exists(&self, artifact: &ArtifactRef) -> Result<bool> {
        let path = self.resolve(&artifact.key)?;
        let deleted = remove_if_exists(&path)
            .await
            .map_err(|e| ConvertdError::io(&path, e))?;
        if deleted {
            debug!(key = %artifact.key, "Deleted artifact");
        }
        Ok(deleted)
    }

    async fn exists(&self, artifact: &ArtifactRef) -> Result<bool> {
        let path = self.resolve(&artifact.key)?;
        file_exists(&path)
            .await
            .map_err(|e| ConvertdError::io(&path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, LocalArtifactStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(temp_dir.path().join("artifacts"));
        store.initialize().await.unwrap();
        (temp_dir, store)
    }

    async fn read_all(mut stream: ArtifactStream) -> Vec<u8> {
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk.unwrap());
        }
        data
    }

    #[tokio::test]
    async fn test_initialize_creates_directories() {
        let (_temp_dir, store) = setup().await;
        assert!(store.root().join("uploads").is_dir());
        assert!(store.root().join("processed").is_dir());
    }

    #[tokio::test]
    async fn test_put_and_open() {
        let (_temp_dir, store) = setup().await;

        let artifact = store
            .put(ArtifactKind::Output, "my report.pdf", Bytes::from_static(b"%PDF-1.7"))
            .await
            .unwrap();

        assert!(artifact.key.starts_with("processed/"));
        assert!(artifact.key.ends_with("_my_report.pdf"));
        assert_eq!(artifact.file_name, "my_report.pdf");
        assert_eq!(artifact.content_type, "application/pdf");
        assert_eq!(artifact.size, 8);

        let stream = store.open(&artifact).await.unwrap();
        assert_eq!(read_all(stream).await, b"%PDF-1.7");
    }

    #[tokio::test]
    async fn test_delete_if_exists_is_idempotent() {
        let (_temp_dir, store) = setup().await;
        let artifact = store
            .put(ArtifactKind::Input, "input.txt", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        assert!(store.exists(&artifact).await.unwrap());
        assert!(store.delete_if_exists(&artifact).await.unwrap());
        assert!(!store.delete_if_exists(&artifact).await.unwrap());
        assert!(!store.exists(&artifact).await.unwrap());
    }

    #[tokio::test]
    async fn test_open_missing_artifact_fails() {
        let (_temp_dir, store) = setup().await;
        let artifact = store
            .put(ArtifactKind::Output, "gone.txt", Bytes::from_static(b"x"))
            .await
            .unwrap();
        store.delete_if_exists(&artifact).await.unwrap();

        let result = store.open(&artifact).await;
        assert!(matches!(result, Err(ConvertdError::Io { .. })));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let (_temp_dir, store) = setup().await;
        let artifact = ArtifactRef {
            key: "../outside.txt".to_string(),
            kind: ArtifactKind::Output,
            file_name: "outside.txt".to_string(),
            content_type: "text/plain".to_string(),
            size: 0,
        };

        assert!(matches!(
            store.delete_if_exists(&artifact).await,
            Err(ConvertdError::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_stale() {
        let (_temp_dir, store) = setup().await;
        store
            .put(ArtifactKind::Input, "a.txt", Bytes::from_static(b"a"))
            .await
            .unwrap();
        store
            .put(ArtifactKind::Output, "b.txt", Bytes::from_static(b"b"))
            .await
            .unwrap();

        assert_eq!(store.remove_stale().await.unwrap(), 2);
        assert_eq!(store.remove_stale().await.unwrap(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_artifact_permissions_unix() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp_dir, store) = setup().await;
        let artifact = store
            .put(ArtifactKind::Output, "private.txt", Bytes::from_static(b"secret"))
            .await
            .unwrap();

        let path = store.root().join(&artifact.key);
        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
