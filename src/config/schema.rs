use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::utils::{ConvertdError, Result};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_CLEANUP_DELAY_MS: u64 = 1000;
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_MEMORY_WARNING_MB: u64 = 200;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Root of `uploads/` and `processed/`; defaults to `~/.convertd/artifacts`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_dir: Option<PathBuf>,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Pause between the end of a download stream and artifact deletion
    #[serde(default = "default_cleanup_delay_ms")]
    pub download_cleanup_delay_ms: u64,

    /// Request body cap enforced before any category limit
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    #[serde(default = "default_memory_warning_mb")]
    pub memory_warning_mb: u64,

    #[serde(default = "default_categories")]
    pub categories: Vec<CategoryConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            artifact_dir: None,
            sweep_interval_secs: default_sweep_interval_secs(),
            download_cleanup_delay_ms: default_cleanup_delay_ms(),
            max_upload_bytes: default_max_upload_bytes(),
            memory_warning_mb: default_memory_warning_mb(),
            categories: default_categories(),
            worker: None,
        }
    }
}

/// One tool family with its own registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryConfig {
    /// URL segment, e.g. `file-tools`
    pub name: String,
    pub ttl_secs: u64,
    pub max_upload_bytes: u64,
    /// Exact MIME types, or prefixes ending in `/`. Empty accepts anything.
    #[serde(default)]
    pub allowed_types: Vec<String>,
    #[serde(default)]
    pub mode: ConversionMode,
    pub converter: ConverterKind,
}

impl CategoryConfig {
    pub fn accepts_content_type(&self, content_type: &str) -> bool {
        if self.allowed_types.is_empty() {
            return true;
        }
        // Ignore parameters such as `; charset=utf-8`
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        self.allowed_types.iter().any(|allowed| {
            let allowed = allowed.to_ascii_lowercase();
            if allowed.ends_with('/') {
                essence.starts_with(&allowed)
            } else {
                essence == allowed
            }
        })
    }
}

/// When the conversion runs relative to the HTTP request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionMode {
    /// Convert before answering; the session is created ready
    #[default]
    Sync,
    /// Answer at once with a pending session and convert in the background
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConverterKind {
    Note,
    Format,
    /// Forward to the supervised worker at `endpoint`
    Worker { endpoint: String },
}

/// External conversion process kept alive by the supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_worker_port")]
    pub port: u16,
    /// Output line that signals the worker accepts requests
    #[serde(default = "default_ready_marker")]
    pub ready_marker: String,
    #[serde(default = "default_respawn_delay_secs")]
    pub respawn_delay_secs: u64,
    /// Give up after this many restarts; unset restarts forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<u32>,
    /// Worker download route, `{id}` is replaced by the download id
    #[serde(default = "default_download_path")]
    pub download_path: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Time the worker gets to exit after SIGTERM before it is killed
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

impl WorkerConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            port: default_worker_port(),
            ready_marker: default_ready_marker(),
            respawn_delay_secs: default_respawn_delay_secs(),
            max_restarts: None,
            download_path: default_download_path(),
            request_timeout_secs: default_request_timeout_secs(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

impl Config {
    /// Artifact root, falling back to `~/.convertd/artifacts`
    pub fn artifact_dir(&self) -> PathBuf {
        self.artifact_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .map(|home| home.join(".convertd").join("artifacts"))
                .unwrap_or_else(|| PathBuf::from("convertd-artifacts"))
        })
    }

    pub fn category(&self, name: &str) -> Option<&CategoryConfig> {
        self.categories.iter().find(|c| c.name == name)
    }

    /// Rejects settings the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConvertdError::config(format!(
                "bind_addr '{}' is not a socket address",
                self.bind_addr
            )));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConvertdError::config("sweep_interval_secs must be positive"));
        }
        if self.max_upload_bytes == 0 {
            return Err(ConvertdError::config("max_upload_bytes must be positive"));
        }
        if self.categories.is_empty() {
            return Err(ConvertdError::config("at least one category is required"));
        }

        let mut seen = HashSet::new();
        for category in &self.categories {
            validate_category_name(&category.name)?;
            if !seen.insert(category.name.as_str()) {
                return Err(ConvertdError::config(format!(
                    "duplicate category '{}'",
                    category.name
                )));
            }
            if category.ttl_secs == 0 {
                return Err(ConvertdError::config(format!(
                    "category '{}': ttl_secs must be positive",
                    category.name
                )));
            }
            if category.max_upload_bytes == 0 {
                return Err(ConvertdError::config(format!(
                    "category '{}': max_upload_bytes must be positive",
                    category.name
                )));
            }
            if let ConverterKind::Worker { endpoint } = &category.converter {
                if self.worker.is_none() {
                    return Err(ConvertdError::config(format!(
                        "category '{}' uses the worker converter but no worker is configured",
                        category.name
                    )));
                }
                if !endpoint.starts_with('/') {
                    return Err(ConvertdError::config(format!(
                        "category '{}': worker endpoint must start with '/'",
                        category.name
                    )));
                }
            }
        }

        if let Some(worker) = &self.worker {
            if worker.program.trim().is_empty() {
                return Err(ConvertdError::config("worker.program is empty"));
            }
            if worker.port == 0 {
                return Err(ConvertdError::config("worker.port must be set"));
            }
            if worker.respawn_delay_secs == 0 {
                return Err(ConvertdError::config(
                    "worker.respawn_delay_secs must be positive",
                ));
            }
            if !worker.download_path.starts_with('/') || !worker.download_path.contains("{id}") {
                return Err(ConvertdError::config(
                    "worker.download_path must start with '/' and contain '{id}'",
                ));
            }
        }

        Ok(())
    }
}

fn validate_category_name(name: &str) -> Result<()> {
    let well_formed = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !well_formed {
        return Err(ConvertdError::config(format!(
            "category name '{}' must be lowercase letters, digits and '-'",
            name
        )));
    }
    // `/api/worker/...` is the raw worker proxy
    if name == "worker" {
        return Err(ConvertdError::config("category name 'worker' is reserved"));
    }
    Ok(())
}

fn default_bind_addr() -> String {
    DEFAULT_BIND_ADDR.to_string()
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_cleanup_delay_ms() -> u64 {
    DEFAULT_CLEANUP_DELAY_MS
}

fn default_max_upload_bytes() -> u64 {
    DEFAULT_MAX_UPLOAD_BYTES
}

fn default_memory_warning_mb() -> u64 {
    DEFAULT_MEMORY_WARNING_MB
}

fn default_worker_port() -> u16 {
    5001
}

fn default_ready_marker() -> String {
    "Running on".to_string()
}

fn default_respawn_delay_secs() -> u64 {
    5
}

fn default_download_path() -> String {
    "/download/{id}".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_stop_grace_secs() -> u64 {
    3
}

/// Built-in categories: file and image conversions live 4 minutes, notes 4 hours
pub fn default_categories() -> Vec<CategoryConfig> {
    vec![
        CategoryConfig {
            name: "file-tools".to_string(),
            ttl_secs: 4 * 60,
            max_upload_bytes: 50 * MIB,
            allowed_types: vec![
                "application/pdf".to_string(),
                "application/msword".to_string(),
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
                    .to_string(),
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".to_string(),
                "application/vnd.openxmlformats-officedocument.presentationml.presentation"
                    .to_string(),
                "application/rtf".to_string(),
                "application/json".to_string(),
                "text/".to_string(),
            ],
            mode: ConversionMode::Sync,
            converter: ConverterKind::Format,
        },
        CategoryConfig {
            name: "image-tools".to_string(),
            ttl_secs: 4 * 60,
            max_upload_bytes: 50 * MIB,
            allowed_types: vec!["image/".to_string()],
            mode: ConversionMode::Sync,
            converter: ConverterKind::Format,
        },
        CategoryConfig {
            name: "notes".to_string(),
            ttl_secs: 4 * 60 * 60,
            max_upload_bytes: MIB,
            allowed_types: Vec::new(),
            mode: ConversionMode::Sync,
            converter: ConverterKind::Note,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.sweep_interval_secs, 60);
        assert_eq!(config.download_cleanup_delay_ms, 1000);
        assert!(config.worker.is_none());
        assert_eq!(config.category("file-tools").unwrap().ttl_secs, 240);
        assert_eq!(config.category("notes").unwrap().ttl_secs, 14_400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserialization_fills_defaults() {
        let json = r#"{
            "bind_addr": "0.0.0.0:9000",
            "categories": [
                { "name": "pdf-tools", "ttl_secs": 240, "max_upload_bytes": 1048576,
                  "mode": "deferred", "converter": { "type": "worker", "endpoint": "/api/pdf-converter/upload" } }
            ],
            "worker": { "program": "python3", "args": ["pdf_service.py"] }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.sweep_interval_secs, 60);

        let category = config.category("pdf-tools").unwrap();
        assert_eq!(category.mode, ConversionMode::Deferred);
        assert_eq!(
            category.converter,
            ConverterKind::Worker {
                endpoint: "/api/pdf-converter/upload".to_string()
            }
        );

        let worker = config.worker.as_ref().unwrap();
        assert_eq!(worker.port, 5001);
        assert_eq!(worker.ready_marker, "Running on");
        assert_eq!(worker.respawn_delay_secs, 5);
        assert!(worker.max_restarts.is_none());
        assert_eq!(worker.stop_grace_secs, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"type\":\"format\""));
        assert!(json.contains("file-tools"));
        assert!(!json.contains("worker\""));
    }

    #[test]
    fn test_validate_rejects_worker_category_without_worker() {
        let mut config = Config::default();
        config.categories.push(CategoryConfig {
            name: "pdf-tools".to_string(),
            ttl_secs: 240,
            max_upload_bytes: MIB,
            allowed_types: Vec::new(),
            mode: ConversionMode::Sync,
            converter: ConverterKind::Worker {
                endpoint: "/convert".to_string(),
            },
        });
        assert!(matches!(config.validate(), Err(ConvertdError::Config { .. })));

        config.worker = Some(WorkerConfig::new("python3"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_categories() {
        let mut config = Config::default();
        config.categories[0].ttl_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.categories[1].name = "file-tools".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.categories[0].name = "Bad Name".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.categories[0].name = "worker".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = Config {
            sweep_interval_secs: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_accepts_content_type() {
        let config = Config::default();
        let files = config.category("file-tools").unwrap();
        assert!(files.accepts_content_type("application/pdf"));
        assert!(files.accepts_content_type("text/plain; charset=utf-8"));
        assert!(!files.accepts_content_type("image/png"));

        let images = config.category("image-tools").unwrap();
        assert!(images.accepts_content_type("image/webp"));
        assert!(!images.accepts_content_type("application/pdf"));

        let notes = config.category("notes").unwrap();
        assert!(notes.accepts_content_type("anything/at-all"));
    }
}
