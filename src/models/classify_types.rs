use crate::models::image_types::ImageHandle;
use serde::{Deserialize, Serialize};

/// Number of ranked predictions returned for one image.
pub const TOP_K: usize = 5;

/// One normalized prediction. Within a result list, scores are non-increasing.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ClassificationResult {
    pub label: String,
    pub score: f32,
}

/// A prediction as the engine reported it, before validation.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct RawPrediction {
    #[serde(default, alias = "class_name")]
    pub label: Option<String>,
    #[serde(default, alias = "confidence")]
    pub score: Option<f64>,
}

impl RawPrediction {
    pub fn new(label: impl Into<String>, score: f64) -> Self {
        Self {
            label: Some(label.into()),
            score: Some(score),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    Gpu,
    Cpu,
}

/// The one model this process classifies with.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelSpec {
    pub model_id: String,
    pub device: DevicePreference,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Uninitialized,
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ModelStatus {
    pub state: SessionState,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum UiState {
    Idle,
    ImageSelected,
    AwaitingModel,
    Inferring,
    ResultsReady,
    Errored,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyState {
    Idle,
    LoadingModel,
    Inferring,
}

/// Where a classification currently is, as seen by whoever started it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassifyPhase {
    AwaitingModel,
    Inferring,
}

/// Everything the core tells the presentation layer.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged { state: UiState },
    Busy { busy: BusyState },
    ResultsReady { results: Vec<ClassificationResult> },
    Error { kind: String, message: String },
    DownloadProgress { percent: u8 },
}

/// What happened to a `classify()` call on the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifyOutcome {
    Delivered(Vec<ClassificationResult>),
    /// The selection changed or was cleared before the result arrived.
    Discarded,
    NoImageSelected,
    AlreadyInFlight,
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub ui_state: UiState,
    pub busy: BusyState,
    pub image: Option<ImageHandle>,
    pub results: Vec<ClassificationResult>,
    pub error: Option<String>,
}
