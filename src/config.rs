//! Host configuration and logging setup
//!
//! `{data_dir}/config/host.json` holds process-level knobs. User-facing
//! settings (threshold, prefix, API key) live in the store instead.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::orchestrator::api_brief::{DEFAULT_API_BASE, DEFAULT_BRIEF_MODEL};
use crate::store::atomic_write;

/// Directory name under the platform data dir
pub const APP_IDENTIFIER: &str = "dev.weaver.host";

const CONFIG_DIR: &str = "config";
const CONFIG_FILE: &str = "host.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine data directory")]
    NoDataDir,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

impl Serialize for ConfigError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    /// Root for the store and the local archive. Filled from the platform
    /// data dir when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Quiet period for debounced watchers: the sentinel's root check when a
    /// page driver spawns it, and `weaver watch`
    pub debounce_ms: u64,
    /// Bound on every collaborator call inside a checkpoint stage
    pub stage_timeout_secs: u64,
    /// Bound on bus requests relayed from stdin
    pub request_timeout_secs: u64,
    pub brief_model: String,
    pub api_base: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            debounce_ms: 300,
            stage_timeout_secs: 120,
            request_timeout_secs: 10,
            brief_model: DEFAULT_BRIEF_MODEL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

/// Platform data directory for this app
pub fn default_data_dir() -> Result<PathBuf, ConfigError> {
    let base = dirs::data_dir().ok_or(ConfigError::NoDataDir)?;
    Ok(base.join(APP_IDENTIFIER))
}

fn env_u64(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(None),
    }
}

impl HostConfig {
    /// Resolve the data dir, load `config/host.json` (writing defaults on
    /// first run) and apply env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let data_dir = match std::env::var_os("WEAVER_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir()?,
        };
        let mut config = Self::load_from(&data_dir)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Load from an explicit data dir without env overrides
    pub fn load_from(data_dir: &Path) -> Result<Self, ConfigError> {
        let path = data_dir.join(CONFIG_DIR).join(CONFIG_FILE);
        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str::<HostConfig>(&content)?
        } else {
            let config = HostConfig::default();
            fs::create_dir_all(data_dir.join(CONFIG_DIR))?;
            atomic_write(&path, &serde_json::to_string_pretty(&config)?)?;
            tracing::info!(path = %path.display(), "Wrote default host config");
            config
        };
        if config.data_dir.is_none() {
            config.data_dir = Some(data_dir.to_path_buf());
        }
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(ms) = env_u64("WEAVER_DEBOUNCE_MS")? {
            self.debounce_ms = ms;
        }
        if let Some(secs) = env_u64("WEAVER_STAGE_TIMEOUT_SECS")? {
            self.stage_timeout_secs = secs;
        }
        Ok(())
    }

    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir(),
        }
    }

    pub fn store_dir(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join("store"))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Install the stderr fmt subscriber. Filter from `WEAVER_LOG`, then
/// `RUST_LOG`, default `info`. Stdout stays free for the host protocol.
pub fn init_logging() {
    let filter = std::env::var("WEAVER_LOG")
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_first_load_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let config = HostConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.debounce_ms, 300);
        assert_eq!(config.data_dir.as_deref(), Some(dir.path()));
        assert!(dir.path().join("config/host.json").exists());
        assert_eq!(config.store_dir().unwrap(), dir.path().join("store"));
    }

    #[test]
    fn test_missing_fields_fall_back() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("config")).unwrap();
        fs::write(dir.path().join("config/host.json"), r#"{"stageTimeoutSecs": 5}"#).unwrap();

        let config = HostConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.stage_timeout(), Duration::from_secs(5));
        assert_eq!(config.brief_model, DEFAULT_BRIEF_MODEL);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("config")).unwrap();
        fs::write(dir.path().join("config/host.json"), "{").unwrap();
        assert!(matches!(HostConfig::load_from(dir.path()), Err(ConfigError::Parse(_))));
    }
}
