use crate::error::AppError;
use crate::models::classify_types::{ClassificationResult, ClassifyPhase, RawPrediction, TOP_K};
use crate::models::image_types::{ImageHandle, ImageSource};
use crate::services::classifier::engine::{EngineLoader, InferenceSession};
use crate::services::classifier::model_manager::ModelManager;
use image::ImageReader;
use std::io::Cursor;
use std::time::Instant;
use tracing::{debug, info};

/// Turns an image into a ranked list of at most `TOP_K` labels.
///
/// Holds no per-request state, so concurrent calls are independent. Keeping a
/// single classification active per view is the caller's job.
pub struct Orchestrator<L: EngineLoader> {
    manager: ModelManager<L>,
}

impl<L: EngineLoader> Clone for Orchestrator<L> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
        }
    }
}

impl<L: EngineLoader> Orchestrator<L> {
    pub fn new(manager: ModelManager<L>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &ModelManager<L> {
        &self.manager
    }

    pub async fn classify(&self, image: &ImageHandle) -> Result<Vec<ClassificationResult>, AppError> {
        self.classify_with(image, |_| {}).await
    }

    /// Like [`classify`](Self::classify), reporting each phase as it starts.
    pub async fn classify_with<F>(
        &self,
        image: &ImageHandle,
        mut on_phase: F,
    ) -> Result<Vec<ClassificationResult>, AppError>
    where
        F: FnMut(ClassifyPhase) + Send,
    {
        // Reject bad input before paying for a model load
        validate_image(image).await?;

        if !self.manager.is_ready() {
            on_phase(ClassifyPhase::AwaitingModel);
        }
        let session = self.manager.get_session().await?;

        on_phase(ClassifyPhase::Inferring);
        let started = Instant::now();
        let raw = session
            .infer(image, TOP_K)
            .await
            .map_err(AppError::into_inference)?;

        let results = normalize_predictions(raw, TOP_K);
        info!(
            image = %image.name,
            results = results.len(),
            top = results.first().map(|r| r.label.as_str()).unwrap_or("-"),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Classification complete"
        );
        Ok(results)
    }
}

/// Checks that the reference points at something with a recognizable image
/// header. Reads only the header, never the full pixel data.
pub async fn validate_image(image: &ImageHandle) -> Result<(), AppError> {
    match &image.source {
        ImageSource::Bytes(bytes) => {
            if bytes.is_empty() {
                return Err(AppError::InvalidInput(format!("{} is empty", image.name)));
            }
            read_dimensions(ImageReader::new(Cursor::new(&bytes[..])), &image.name)
        }
        ImageSource::Path(path) => {
            let metadata = tokio::fs::metadata(path)
                .await
                .map_err(|e| AppError::InvalidInput(format!("Cannot access {}: {}", path.display(), e)))?;
            if !metadata.is_file() {
                return Err(AppError::InvalidInput(format!("{} is not a file", path.display())));
            }
            if metadata.len() == 0 {
                return Err(AppError::InvalidInput(format!("{} is empty", path.display())));
            }

            let path = path.clone();
            let name = image.name.clone();
            tokio::task::spawn_blocking(move || {
                let reader = ImageReader::open(&path)
                    .map_err(|e| AppError::InvalidInput(format!("Cannot open {}: {}", path.display(), e)))?;
                read_dimensions(reader, &name)
            })
            .await
            .map_err(inspection_failed)?
        }
    }
}

/// A header reader that panicked could not make sense of the input.
fn inspection_failed(e: tokio::task::JoinError) -> AppError {
    AppError::InvalidInput(format!("Image inspection failed: {}", e))
}

fn read_dimensions<R: std::io::BufRead + std::io::Seek>(reader: ImageReader<R>, name: &str) -> Result<(), AppError> {
    let reader = reader
        .with_guessed_format()
        .map_err(|e| AppError::InvalidInput(format!("Cannot read {}: {}", name, e)))?;
    if reader.format().is_none() {
        return Err(AppError::InvalidInput(format!("{} is not a recognized image format", name)));
    }
    let (w, h) = reader
        .into_dimensions()
        .map_err(|e| AppError::InvalidInput(format!("{} is not decodable: {}", name, e)))?;
    if w == 0 || h == 0 {
        return Err(AppError::InvalidInput(format!("{} has no pixels", name)));
    }
    Ok(())
}

/// Drops malformed records, ranks by descending score and keeps the first `top_k`.
pub fn normalize_predictions(raw: Vec<RawPrediction>, top_k: usize) -> Vec<ClassificationResult> {
    let mut results: Vec<ClassificationResult> = raw
        .into_iter()
        .filter_map(|p| match (p.label, p.score) {
            (Some(label), Some(score))
                if !label.trim().is_empty() && score.is_finite() && (0.0..=1.0).contains(&score) =>
            {
                Some(ClassificationResult {
                    label,
                    score: score as f32,
                })
            }
            (label, score) => {
                debug!(?label, ?score, "Dropping malformed prediction");
                None
            }
        })
        .collect();

    // Stable, so equal scores keep engine order
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    results.truncate(top_k);
    results
}
