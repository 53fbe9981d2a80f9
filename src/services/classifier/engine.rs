//! Boundary between the classifier core and whatever ML runtime backs it.

use crate::error::AppError;
use crate::models::classify_types::{ModelSpec, RawPrediction};
use crate::models::image_types::ImageHandle;
use async_trait::async_trait;

/// Builds a reusable session for one fixed model. Construction may download
/// weights and is expected to be slow.
#[async_trait]
pub trait EngineLoader: Send + Sync + 'static {
    type Session: InferenceSession;

    async fn load(&self, spec: &ModelSpec) -> Result<Self::Session, AppError>;
}

/// A constructed engine. Shared read-only across classification calls.
#[async_trait]
pub trait InferenceSession: Send + Sync + 'static {
    /// Returns up to `top_k` predictions, nominally ordered by score. The
    /// records are untrusted and get validated by the orchestrator.
    async fn infer(&self, image: &ImageHandle, top_k: usize)
        -> Result<Vec<RawPrediction>, AppError>;
}
