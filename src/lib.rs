pub mod commands;
pub mod config;
pub mod error;
pub mod models;
pub mod services;

pub use config::ClassifierConfig;
pub use error::AppError;
pub use models::classify_types::{
    BusyState, ClassificationResult, ClassifyOutcome, ModelSpec, ModelStatus, RawPrediction, SessionEvent,
    SessionState, UiState, TOP_K,
};
pub use models::image_types::{ImageHandle, ImageSource};
pub use services::classifier::engine::{EngineLoader, InferenceSession};
pub use services::classifier::model_manager::ModelManager;
pub use services::classifier::orchestrator::Orchestrator;
pub use services::session_controller::SessionController;
