use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "VIDGEN_DATA_DIR";

const ENV_MODEL_BASE: &str = "MODEL_BASE";
const ENV_SAVE_PATH: &str = "SAVE_PATH";
const ENV_MAX_WORKERS: &str = "MAX_WORKERS";
const ENV_HOST: &str = "HOST";
const ENV_PORT: &str = "PORT";
const ENV_RELAY_API_BASE_URL: &str = "N8N_API_BASE_URL";
const ENV_RELAY_HOST: &str = "N8N_WEBHOOK_HOST";
const ENV_RELAY_PORT: &str = "N8N_WEBHOOK_PORT";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub workers: WorkersConfig,
    pub model: ModelConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Root directory holding model weights and supporting assets.
    pub model_root: PathBuf,
    /// Directory generated videos are written to.
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkersConfig {
    /// Number of generation jobs allowed to run at the same time.
    pub pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// Start loading the model in the background as soon as the server starts.
    pub preload: bool,
    pub sampler_program: String,
    pub sampler_args: Vec<String>,
    pub encoder_program: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    pub api_base_url: String,
    pub host: String,
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            server: ServerConfig::default(),
            workers: WorkersConfig::default(),
            model: ModelConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            model_root: PathBuf::from("ckpts"),
            output_dir: PathBuf::from("results"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 10000,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { pool_size: 2 }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            preload: true,
            sampler_program: "hyvideo-sample".to_string(),
            sampler_args: Vec::new(),
            encoder_program: "ffmpeg".to_string(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:10000".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl WorkersConfig {
    pub fn effective_pool_size(&self) -> usize {
        self.pool_size.max(1)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Apply deployment overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| env::var(key).ok());
    }

    /// Apply deployment overrides from an arbitrary key lookup.
    ///
    /// Numeric values that fail to parse are ignored with a warning and the
    /// file/default value is kept.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MODEL_BASE) {
            self.paths.model_root = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_SAVE_PATH) {
            self.paths.output_dir = PathBuf::from(value);
        }
        if let Some(value) = parse_override(&lookup, ENV_MAX_WORKERS) {
            self.workers.pool_size = value;
        }
        if let Some(value) = lookup(ENV_HOST) {
            self.server.host = value;
        }
        if let Some(value) = parse_override(&lookup, ENV_PORT) {
            self.server.port = value;
        }
        if let Some(value) = lookup(ENV_RELAY_API_BASE_URL) {
            self.relay.api_base_url = value;
        }
        if let Some(value) = lookup(ENV_RELAY_HOST) {
            self.relay.host = value;
        }
        if let Some(value) = parse_override(&lookup, ENV_RELAY_PORT) {
            self.relay.port = value;
        }
    }

    /// Resolve relative model/output paths against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        self.paths.model_root = resolve_relative_to(base, &self.paths.model_root);
        self.paths.output_dir = resolve_relative_to(base, &self.paths.output_dir);
    }
}

fn parse_override<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. VIDGEN_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and write a default config.toml when none exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
