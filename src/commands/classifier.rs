use crate::config::ClassifierConfig;
use crate::error::AppError;
use crate::models::classify_types::{ClassificationResult, ClassifyOutcome, ModelStatus, SessionEvent};
use crate::models::image_types::ImageHandle;
use crate::services::classifier::engine::EngineLoader;
use crate::services::classifier::model_manager::ModelManager;
use crate::services::classifier::orchestrator::Orchestrator;
use crate::services::classifier::ort_engine::OrtEngineLoader;
use crate::services::session_controller::SessionController;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

pub type OrtController = SessionController<OrtEngineLoader>;

#[derive(Debug, Serialize, Clone)]
pub struct ClassifyReport {
    pub file_name: String,
    pub predictions: Vec<ClassificationResult>,
    pub error: Option<AppError>,
}

/// Wires the ONNX loader, model manager, orchestrator and controller onto one event stream.
pub fn build_controller(config: &ClassifierConfig) -> OrtController {
    let (events, _) = broadcast::channel::<SessionEvent>(64);
    let loader = OrtEngineLoader::new(config.model.clone(), config.intra_threads).with_events(events.clone());
    let manager = ModelManager::new(loader, config.model_spec());
    SessionController::with_events(Orchestrator::new(manager), events)
}

pub fn get_model_status<L: EngineLoader>(controller: &SessionController<L>) -> ModelStatus {
    controller.orchestrator().manager().status()
}

pub async fn load_model<L: EngineLoader>(controller: &SessionController<L>) -> Result<ModelStatus, AppError> {
    let manager = controller.orchestrator().manager();
    manager.preload().await?;
    Ok(manager.status())
}

/// Selects and classifies each image in turn. A failure on one image is
/// recorded in its report and does not stop the rest.
pub async fn classify_images<L: EngineLoader>(
    controller: &SessionController<L>,
    images: &[ImageHandle],
) -> Vec<ClassifyReport> {
    let mut reports = Vec::with_capacity(images.len());

    for image in images {
        controller.select_image(image.clone());
        let (predictions, error) = match controller.classify().await {
            Ok(ClassifyOutcome::Delivered(results)) => (results, None),
            Ok(outcome) => {
                warn!(image = %image.name, ?outcome, "Classification produced no results");
                (Vec::new(), None)
            }
            Err(e) => (Vec::new(), Some(e)),
        };
        reports.push(ClassifyReport {
            file_name: image.name.clone(),
            predictions,
            error,
        });
    }

    controller.clear();
    reports
}
