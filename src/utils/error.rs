//! Centralized error types and conversions for convertd
//!
//! This module provides structured error types using `thiserror` for library code.
//! The binary and daemon wiring use `anyhow` for easy context.

use bytes::Bytes;
use std::path::PathBuf;
use thiserror::Error;

/// Global error type for convertd operations
#[derive(Error, Debug)]
pub enum ConvertdError {
    /// IO errors with path context
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed upload, missing field, unsupported type
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// Upload larger than the category allows
    #[error("Artifact of {size} bytes exceeds the {limit} byte limit")]
    ArtifactTooLarge { size: u64, limit: u64 },

    /// The converter or worker failed to produce an artifact
    #[error("Conversion failed: {message}")]
    ConversionFailure { message: String },

    /// Unknown session id (never existed, already downloaded or reclaimed)
    #[error("Session not found or expired: {session_id}")]
    SessionNotFound { session_id: String },

    /// Session exists but its TTL has elapsed
    #[error("Session has expired: {session_id}")]
    SessionExpired { session_id: String },

    /// Session exists but its output has not been produced yet
    #[error("Session is not ready yet: {session_id}")]
    SessionNotReady { session_id: String },

    /// Worker process not ready or restarting
    #[error("Worker unavailable: {message}")]
    WorkerUnavailable { message: String },

    /// Worker process exited
    #[error("Worker process exited (code: {exit_code:?})")]
    WorkerCrashed { exit_code: Option<i32> },

    /// Worker answered with a non-success status; body is forwarded verbatim
    #[error("Worker responded with status {status}")]
    WorkerResponse {
        status: u16,
        content_type: Option<String>,
        body: Bytes,
    },

    /// Transport failure talking to the worker after it was reachable
    #[error("Worker request failed: {message}")]
    WorkerRequest { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl ConvertdError {
    /// Create an IO error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn too_large(size: u64, limit: u64) -> Self {
        Self::ArtifactTooLarge { size, limit }
    }

    pub fn conversion(message: impl Into<String>) -> Self {
        Self::ConversionFailure {
            message: message.into(),
        }
    }

    pub fn not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    pub fn expired(session_id: impl Into<String>) -> Self {
        Self::SessionExpired {
            session_id: session_id.into(),
        }
    }

    pub fn not_ready(session_id: impl Into<String>) -> Self {
        Self::SessionNotReady {
            session_id: session_id.into(),
        }
    }

    pub fn worker_unavailable(message: impl Into<String>) -> Self {
        Self::WorkerUnavailable {
            message: message.into(),
        }
    }

    pub fn worker_crashed(exit_code: Option<i32>) -> Self {
        Self::WorkerCrashed { exit_code }
    }

    pub fn worker_request(message: impl Into<String>) -> Self {
        Self::WorkerRequest {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true if the client may retry the same request later
    pub fn is_retryable(&self) -> bool {
        match self {
            // Worker is restarting or still booting
            ConvertdError::WorkerUnavailable { .. } => true,
            ConvertdError::WorkerCrashed { .. } => true,
            ConvertdError::WorkerRequest { .. } => true,
            // Deferred conversion still running
            ConvertdError::SessionNotReady { .. } => true,
            // IO errors might be transient (disk full)
            ConvertdError::Io { .. } => true,
            ConvertdError::WorkerResponse { status, .. } => *status >= 500,
            // Needs a new conversion or a corrected request
            ConvertdError::InvalidInput { .. }
            | ConvertdError::ArtifactTooLarge { .. }
            | ConvertdError::ConversionFailure { .. }
            | ConvertdError::SessionNotFound { .. }
            | ConvertdError::SessionExpired { .. }
            | ConvertdError::Config { .. }
            | ConvertdError::Serialization { .. } => false,
        }
    }

    /// Returns the error severity level for logging
    pub fn severity(&self) -> tracing::Level {
        match self {
            ConvertdError::Config { .. } => tracing::Level::ERROR,
            ConvertdError::Serialization { .. } => tracing::Level::ERROR,
            ConvertdError::Io { .. } => tracing::Level::ERROR,
            ConvertdError::WorkerCrashed { .. } => tracing::Level::ERROR,
            ConvertdError::ConversionFailure { .. } => tracing::Level::WARN,
            ConvertdError::WorkerUnavailable { .. } => tracing::Level::WARN,
            ConvertdError::WorkerRequest { .. } => tracing::Level::WARN,
            ConvertdError::WorkerResponse { .. } => tracing::Level::WARN,
            ConvertdError::InvalidInput { .. } => tracing::Level::INFO,
            ConvertdError::ArtifactTooLarge { .. } => tracing::Level::INFO,
            ConvertdError::SessionNotFound { .. } => tracing::Level::DEBUG,
            ConvertdError::SessionExpired { .. } => tracing::Level::DEBUG,
            ConvertdError::SessionNotReady { .. } => tracing::Level::DEBUG,
        }
    }

    /// HTTP status this error maps to at the boundary
    pub fn status_code(&self) -> u16 {
        match self {
            ConvertdError::InvalidInput { .. } => 400,
            ConvertdError::ArtifactTooLarge { .. } => 413,
            ConvertdError::SessionNotFound { .. } => 404,
            ConvertdError::SessionExpired { .. } => 410,
            ConvertdError::SessionNotReady { .. } => 202,
            ConvertdError::WorkerUnavailable { .. } | ConvertdError::WorkerCrashed { .. } => 503,
            ConvertdError::WorkerRequest { .. } => 502,
            ConvertdError::WorkerResponse { status, .. } => *status,
            ConvertdError::ConversionFailure { .. }
            | ConvertdError::Io { .. }
            | ConvertdError::Config { .. }
            | ConvertdError::Serialization { .. } => 500,
        }
    }

    /// Message safe to show to HTTP clients
    ///
    /// IO errors carry server paths, so they collapse to a generic message.
    pub fn client_message(&self) -> String {
        match self {
            ConvertdError::Io { .. } => "Internal storage error".to_string(),
            ConvertdError::SessionNotFound { .. } => "Session not found or expired".to_string(),
            ConvertdError::SessionExpired { .. } => "Download link has expired".to_string(),
            ConvertdError::SessionNotReady { .. } => "Conversion is still in progress".to_string(),
            ConvertdError::WorkerCrashed { .. } => "Conversion service is restarting".to_string(),
            other => other.to_string(),
        }
    }
}

/// Result type alias using ConvertdError
pub type Result<T> = std::result::Result<T, ConvertdError>;

// Automatic error conversions for seamless ? operator usage

impl From<std::io::Error> for ConvertdError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source: err,
        }
    }
}

impl From<serde_json::Error> for ConvertdError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for ConvertdError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::WorkerUnavailable {
                message: format!("connection refused: {}", err),
            }
        } else {
            Self::WorkerRequest {
                message: err.to_string(),
            }
        }
    }
}
