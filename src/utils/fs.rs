//! Async filesystem helpers
//!
//! Thin wrappers around `tokio::fs` so cleanup paths never block the runtime
//! and never fail on files that are already gone.

use std::io;
use std::path::Path;

/// Returns `true` if the path exists (async, non-blocking).
///
/// A missing path returns `Ok(false)`, not an error.
pub async fn file_exists(path: impl AsRef<Path>) -> io::Result<bool> {
    tokio::fs::try_exists(path).await
}

/// Deletes a file if it exists.
///
/// Returns `Ok(true)` when a file was removed and `Ok(false)` when there was
/// nothing to remove, so two racing deleters of the same path both succeed.
pub async fn remove_if_exists(path: impl AsRef<Path>) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Restricts a file to owner read/write on unix. No-op elsewhere.
pub async fn set_owner_only(path: impl AsRef<Path>) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(path, permissions).await?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
