//! Classifier configuration.
//!
//! Sources, later ones overriding earlier ones:
//! 1. Built-in defaults
//! 2. A TOML file (`image-lens.toml` in the working directory, or `--config`)
//! 3. Environment variables prefixed with `IMAGE_LENS__`, e.g.
//!    `IMAGE_LENS__DEVICE=cpu` or `IMAGE_LENS__MODEL__DIR=/var/cache/models`
//! 4. Command-line flags

use crate::error::AppError;
use crate::models::classify_types::{DevicePreference, ModelSpec};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "image-lens.toml";
pub const DEFAULT_MODEL_ID: &str = "onnx-community/mobilenetv4_conv_small.e2400_r224_in1k";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default = "default_device")]
    pub device: DevicePreference,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

/// Where the single model lives, remotely and in the local cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_id")]
    pub id: String,
    #[serde(default = "default_hub_url")]
    pub hub_url: String,
    #[serde(default = "default_weights_file")]
    pub weights_file: String,
    #[serde(default = "default_config_file")]
    pub config_file: String,
    #[serde(default = "default_model_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_crop_size")]
    pub crop_size: u32,
}

fn default_device() -> DevicePreference {
    DevicePreference::Gpu
}

fn default_intra_threads() -> usize {
    4
}

fn default_model_id() -> String {
    DEFAULT_MODEL_ID.to_string()
}

fn default_hub_url() -> String {
    "https://huggingface.co".to_string()
}

fn default_weights_file() -> String {
    "onnx/model.onnx".to_string()
}

fn default_config_file() -> String {
    "config.json".to_string()
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_crop_size() -> u32 {
    224
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            id: default_model_id(),
            hub_url: default_hub_url(),
            weights_file: default_weights_file(),
            config_file: default_config_file(),
            dir: default_model_dir(),
            crop_size: default_crop_size(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            device: default_device(),
            intra_threads: default_intra_threads(),
        }
    }
}

impl ClassifierConfig {
    /// Loads defaults, then the file (required only when given explicitly), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix("IMAGE_LENS").prefix_separator("__").separator("__"))
            .build()?;

        let config: ClassifierConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.model.id.trim().is_empty() {
            return Err(AppError::Config("model.id must not be empty".to_string()));
        }
        if self.model.crop_size == 0 {
            return Err(AppError::Config("model.crop_size must be positive".to_string()));
        }
        if self.intra_threads == 0 {
            return Err(AppError::Config("intra_threads must be positive".to_string()));
        }
        Ok(())
    }

    pub fn model_spec(&self) -> ModelSpec {
        ModelSpec {
            model_id: self.model.id.clone(),
            device: self.device,
        }
    }
}
