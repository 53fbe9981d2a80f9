use serde::Serialize;

/// Every failure the classifier can surface to a caller.
///
/// Cloneable so a single model-load failure can be handed to every caller
/// that was waiting on the same construction.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum AppError {
    /// The image reference was missing, empty or not decodable.
    #[error("Invalid image: {0}")]
    InvalidInput(String),
    /// The inference session could not be constructed.
    #[error("Failed to load model: {0}")]
    ModelLoad(String),
    /// A ready session failed to run or returned an unusable shape.
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "invalid_input",
            AppError::ModelLoad(_) => "model_load",
            AppError::Inference(_) => "inference",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
        }
    }

    /// Re-labels any failure raised while building a session as a model-load failure.
    pub fn into_model_load(self) -> Self {
        match self {
            AppError::ModelLoad(_) => self,
            other => AppError::ModelLoad(other.to_string()),
        }
    }

    /// Re-labels an engine failure as an inference failure. Bad input stays bad input.
    pub fn into_inference(self) -> Self {
        match self {
            AppError::Inference(_) | AppError::InvalidInput(_) => self,
            other => AppError::Inference(other.to_string()),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

impl From<image::ImageError> for AppError {
    fn from(err: image::ImageError) -> Self {
        AppError::InvalidInput(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ModelLoad(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::ModelLoad(format!("Invalid model config JSON: {}", err))
    }
}
