use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::InferenceBackend;
use crate::pipeline::PipelineOptions;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "SUPERRES_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub path: PathBuf,
    /// Enlargement factor the model applies to each tile dimension.
    pub scale: usize,
    pub backend: InferenceBackend,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Largest tile area handed to the model in one call.
    pub max_tile_pixels: usize,
    /// Largest input image area a request may declare.
    pub max_image_pixels: usize,
    /// 0 disables the admission limit.
    pub max_in_flight: usize,
    /// 0 disables the per-call timeout.
    pub inference_timeout_secs: u64,
    /// Collect the whole output before answering so failures are always a clean 500.
    pub buffer_response: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models/esrgan.onnx"),
            scale: 4,
            backend: InferenceBackend::default(),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_tile_pixels: 128 * 128,
            max_image_pixels: 4096 * 4096,
            max_in_flight: 0,
            inference_timeout_secs: 0,
            buffer_response: false,
        }
    }
}

impl PipelineConfig {
    pub fn options(&self, expected_len: Option<u64>) -> PipelineOptions {
        PipelineOptions {
            max_in_flight: (self.max_in_flight > 0).then_some(self.max_in_flight),
            inference_timeout: (self.inference_timeout_secs > 0)
                .then(|| Duration::from_secs(self.inference_timeout_secs)),
            expected_len,
        }
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
            .with_context(|| format!("failed to write config file: {}", path.display()))
    }

    /// Anchor relative model and cache paths at `data_dir`.
    pub fn resolve_paths(mut self, data_dir: &Path) -> Self {
        self.model.path = resolve_relative_to(data_dir, &self.model.path);
        self.model.trt_cache_dir = resolve_relative_to(data_dir, &self.model.trt_cache_dir);
        self
    }
}

/// Resolve the data directory: CLI override, then `SUPERRES_DATA_DIR`,
/// then `./data`.
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

/// Create the data directory and write a default config.toml if none exists.
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

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
