use crate::config::schema::Config;
use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[cfg(test)]
use std::sync::Mutex;

#[cfg(test)]
pub(crate) static CONFIG_TEST_ENV_LOCK: Mutex<()> = Mutex::new(());

/// Prefix of the per-category TTL override, e.g. `CONVERTD_TTL_SECS_FILE_TOOLS`
pub const TTL_ENV_PREFIX: &str = "CONVERTD_TTL_SECS_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file contains invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Configuration file {path:?} is writable by other users (mode {mode:o})")]
    InsecurePermissions { path: PathBuf, mode: u32 },
}

pub fn load_config(cli_bind: Option<String>, cli_config_path: Option<PathBuf>) -> Result<Config> {
    tracing::debug!("Loading configuration");

    let mut config = Config::default();

    // Layer 1: Load from config file (~/.convertd/config.json)
    let config_file = cli_config_path.clone().or_else(get_default_config_path);

    if let Some(ref path) = config_file {
        if path.exists() {
            tracing::debug!(config_path = %path.display(), "Loading configuration from file");
            config = merge_config_from_file(config, path)?;
        } else if cli_config_path.is_some() {
            anyhow::bail!("Config file not found: {}", path.display());
        } else {
            tracing::debug!(config_path = %path.display(), "Config file not found, using defaults");
        }
    }

    // Layer 2: Environment variables override
    tracing::debug!("Applying environment variable overrides");
    config = merge_env_variables(config);

    // Layer 3: CLI flags override (highest precedence)
    if let Some(bind) = cli_bind {
        tracing::debug!(bind_addr = %bind, "Applying CLI bind override");
        config.bind_addr = bind;
    }

    config.validate().context("Invalid configuration")?;

    tracing::debug!(
        bind_addr = %config.bind_addr,
        artifact_dir = %config.artifact_dir().display(),
        categories = config.categories.len(),
        worker_configured = config.worker.is_some(),
        "Configuration loaded successfully"
    );

    Ok(config)
}

fn get_default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".convertd").join("config.json"))
}

fn merge_config_from_file(config: Config, path: &Path) -> Result<Config> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(config),
        Err(e) => return Err(e).context("Failed to read metadata for config file"),
    };

    // The file decides which program the supervisor runs
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o022 != 0 {
            return Err(ConfigError::InsecurePermissions {
                path: path.to_path_buf(),
                mode,
            }
            .into());
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    // Missing keys fall back to defaults through serde
    let file_config: Config = serde_json::from_str(&content).map_err(ConfigError::InvalidJson)?;
    Ok(file_config)
}

fn merge_env_variables(mut config: Config) -> Config {
    if let Some(bind) = env_string("CONVERTD_BIND_ADDR") {
        config.bind_addr = bind;
    }
    if let Some(dir) = env_string("CONVERTD_ARTIFACT_DIR") {
        config.artifact_dir = Some(PathBuf::from(dir));
    }
    if let Some(secs) = env_parse("CONVERTD_SWEEP_INTERVAL_SECS") {
        config.sweep_interval_secs = secs;
    }
    if let Some(ms) = env_parse("CONVERTD_CLEANUP_DELAY_MS") {
        config.download_cleanup_delay_ms = ms;
    }
    if let Some(bytes) = env_parse("CONVERTD_MAX_UPLOAD_BYTES") {
        config.max_upload_bytes = bytes;
    }
    if let Some(secs) = env_parse("CONVERTD_WORKER_RESPAWN_DELAY_SECS") {
        if let Some(ref mut worker) = config.worker {
            worker.respawn_delay_secs = secs;
        }
    }

    for category in &mut config.categories {
        let key = ttl_env_key(&category.name);
        if let Some(ttl) = env_parse(&key) {
            tracing::debug!(category = %category.name, ttl_secs = ttl, "Applying TTL override");
            category.ttl_secs = ttl;
        }
    }

    config
}

/// Environment variable holding the TTL override for `category`
pub fn ttl_env_key(category: &str) -> String {
    format!(
        "{}{}",
        TTL_ENV_PREFIX,
        category.to_ascii_uppercase().replace('-', "_")
    )
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key = %key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    // Create parent directory if it doesn't exist
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let json = serde_json::to_string_pretty(config)?;

    let mut file = fs::File::create(path)
        .with_context(|| format!("Failed to create config file: {:?}", path))?;

    file.write_all(json.as_bytes())
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    // Set file permissions to 0600 (owner read/write only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = file.metadata()?.permissions();
        permissions.set_mode(0o600);
        fs::set_permissions(path, permissions)
            .with_context(|| format!("Failed to set permissions on config file: {:?}", path))?;
    }

    tracing::info!("Configuration saved to {:?}", path);
    Ok(())
}

pub fn get_config_path() -> Option<PathBuf> {
    get_default_config_path()
}
