use crate::config::ModelConfig;
use crate::error::AppError;
use crate::models::classify_types::{DevicePreference, ModelSpec, RawPrediction, SessionEvent};
use crate::models::image_types::ImageHandle;
use crate::services::classifier::engine::{EngineLoader, InferenceSession};
use crate::services::classifier::inference;
use async_trait::async_trait;
use futures::StreamExt;
use ort::session::Session;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Builds ONNX Runtime sessions, fetching weights and labels into the
/// local model directory on first use.
pub struct OrtEngineLoader {
    model: ModelConfig,
    intra_threads: usize,
    events: Option<broadcast::Sender<SessionEvent>>,
}

impl OrtEngineLoader {
    pub fn new(model: ModelConfig, intra_threads: usize) -> Self {
        Self {
            model,
            intra_threads,
            events: None,
        }
    }

    /// Reports download progress on the given channel.
    pub fn with_events(mut self, events: broadcast::Sender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn model_path(&self) -> PathBuf {
        self.model.dir.join(cache_file_name(&self.model.weights_file))
    }

    pub fn config_path(&self) -> PathBuf {
        self.model.dir.join(cache_file_name(&self.model.config_file))
    }

    pub fn is_downloaded(&self) -> bool {
        self.model_path().exists() && self.config_path().exists()
    }

    fn file_url(&self, model_id: &str, file: &str) -> String {
        format!(
            "{}/{}/resolve/main/{}",
            self.model.hub_url.trim_end_matches('/'),
            model_id,
            file
        )
    }

    pub async fn download_model(&self, model_id: &str) -> Result<(), AppError> {
        if self.is_downloaded() {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.model.dir)
            .await
            .map_err(|e| AppError::ModelLoad(format!("Failed to create model directory: {}", e)))?;

        let config_path = self.config_path();
        if !config_path.exists() {
            let url = self.file_url(model_id, &self.model.config_file);
            download_file(&url, &config_path, self.events.as_ref()).await?;
        }

        let model_path = self.model_path();
        if !model_path.exists() {
            let url = self.file_url(model_id, &self.model.weights_file);
            download_file(&url, &model_path, self.events.as_ref()).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl EngineLoader for OrtEngineLoader {
    type Session = OrtSession;

    async fn load(&self, spec: &ModelSpec) -> Result<OrtSession, AppError> {
        self.download_model(&spec.model_id).await?;

        let config_path = self.config_path();
        let config_content = tokio::fs::read_to_string(&config_path)
            .await
            .map_err(|e| {
                AppError::ModelLoad(format!("Failed to read config file {}: {}", config_path.display(), e))
            })?;
        let labels = parse_labels(&config_content)?;
        debug!(labels = labels.len(), "Loaded label vocabulary");

        let model_path = self.model_path();
        let device = spec.device;
        let intra_threads = self.intra_threads;
        let session = tokio::task::spawn_blocking(move || build_session(&model_path, device, intra_threads))
            .await
            .map_err(|e| AppError::ModelLoad(format!("Failed to spawn model loading task: {}", e)))??;

        Ok(OrtSession {
            session: Arc::new(Mutex::new(session)),
            labels: labels.into(),
            crop_size: self.model.crop_size,
        })
    }
}

fn build_session(model_path: &Path, device: DevicePreference, intra_threads: usize) -> Result<Session, AppError> {
    let _ = ort::init().with_name("image-lens").commit();

    let mut builder = Session::builder()
        .map_err(|e| AppError::ModelLoad(format!("Failed to create session builder: {}", e)))?
        .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
        .map_err(|e| AppError::ModelLoad(format!("Failed to set optimization level: {}", e)))?
        .with_intra_threads(intra_threads)
        .map_err(|e| AppError::ModelLoad(format!("Failed to set intra threads: {}", e)))?;

    builder = match device {
        DevicePreference::Gpu => builder
            .with_execution_providers([
                ort::execution_providers::DirectMLExecutionProvider::default().build(),
                ort::execution_providers::CoreMLExecutionProvider::default().build(),
                ort::execution_providers::CUDAExecutionProvider::default().build(),
                ort::execution_providers::CPUExecutionProvider::default().build(),
            ])
            .map_err(|e| AppError::ModelLoad(format!("Failed to register GPU execution providers: {}", e)))?,
        DevicePreference::Cpu => builder
            .with_execution_providers([ort::execution_providers::CPUExecutionProvider::default().build()])
            .map_err(|e| AppError::ModelLoad(format!("Failed to register CPU execution provider: {}", e)))?,
    };

    builder
        .commit_from_file(model_path)
        .map_err(|e| AppError::ModelLoad(format!("Failed to load ONNX model {}: {}", model_path.display(), e)))
}

/// Reads the `id2label` map of a model config into a vocabulary ordered by class id.
pub fn parse_labels(config_content: &str) -> Result<Vec<String>, AppError> {
    let config: serde_json::Value = serde_json::from_str(config_content)?;

    let id2label = config["id2label"]
        .as_object()
        .ok_or_else(|| AppError::ModelLoad("Config missing id2label field".to_string()))?;

    let mut labels = id2label
        .iter()
        .map(|(k, v)| {
            let idx = k
                .parse::<usize>()
                .map_err(|_| AppError::ModelLoad(format!("Invalid class id in id2label: {}", k)))?;
            let label = v.as_str().unwrap_or_default().to_string();
            Ok((idx, label))
        })
        .collect::<Result<Vec<(usize, String)>, AppError>>()?;
    labels.sort_by_key(|(idx, _)| *idx);

    Ok(labels.into_iter().map(|(_, label)| label).collect())
}

fn cache_file_name(remote: &str) -> String {
    remote.replace('/', "_")
}

pub struct OrtSession {
    session: Arc<Mutex<Session>>,
    labels: Arc<[String]>,
    crop_size: u32,
}

#[async_trait]
impl InferenceSession for OrtSession {
    async fn infer(&self, image: &ImageHandle, top_k: usize) -> Result<Vec<RawPrediction>, AppError> {
        let session = self.session.clone();
        let labels = self.labels.clone();
        let crop_size = self.crop_size;
        let image = image.clone();

        tokio::task::spawn_blocking(move || {
            let decoded = inference::decode_image(&image)?;
            let tensor = inference::preprocess_image(&decoded, crop_size)?;
            let mut guard = session
                .lock()
                .map_err(|_| AppError::Inference("Model session lock poisoned".to_string()))?;
            inference::run_inference_with_model(&mut guard, tensor, &labels, top_k)
        })
        .await
        .map_err(|e| AppError::Inference(format!("Inference task join failed: {}", e)))?
    }
}

/// Whole-percent download progress, emitting each value at most once.
struct ProgressTracker {
    total: u64,
    downloaded: u64,
    last_emit: u8,
}

impl ProgressTracker {
    fn new(total: u64) -> Self {
        Self {
            total,
            downloaded: 0,
            last_emit: 0,
        }
    }

    /// Records `len` more bytes and returns the new percentage if it advanced.
    fn advance(&mut self, len: u64) -> Option<u8> {
        self.downloaded += len;
        if self.total == 0 {
            return None;
        }
        let percent = ((self.downloaded * 100) / self.total).min(100) as u8;
        if percent > self.last_emit {
            self.last_emit = percent;
            Some(percent)
        } else {
            None
        }
    }

    /// Returns 100 unless it was already reported.
    fn finish(&mut self) -> Option<u8> {
        if self.last_emit < 100 {
            self.last_emit = 100;
            Some(100)
        } else {
            None
        }
    }
}

async fn download_file(
    url: &str,
    dest: &Path,
    events: Option<&broadcast::Sender<SessionEvent>>,
) -> Result<(), AppError> {
    info!(url, dest = %dest.display(), "Downloading model file");
    let client = reqwest::Client::new();
    let response = client.get(url).send().await?;

    if !response.status().is_success() {
        return Err(AppError::ModelLoad(format!(
            "Failed to download {}: HTTP {}",
            url,
            response.status()
        )));
    }

    let mut progress = ProgressTracker::new(response.content_length().unwrap_or(0));
    let partial = dest.with_extension("part");

    let written = write_partial(response, &partial, &mut progress, events).await;
    let finalized = match written {
        Ok(()) => tokio::fs::rename(&partial, dest)
            .await
            .map_err(|e| AppError::ModelLoad(format!("Failed to finalize {}: {}", dest.display(), e))),
        Err(e) => Err(e),
    };
    if let Err(e) = finalized {
        warn!(dest = %dest.display(), error = %e, "Model download failed");
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e);
    }

    if let Some(percent) = progress.finish() {
        emit_progress(events, percent);
    }
    Ok(())
}

async fn write_partial(
    response: reqwest::Response,
    partial: &Path,
    progress: &mut ProgressTracker,
    events: Option<&broadcast::Sender<SessionEvent>>,
) -> Result<(), AppError> {
    let mut file = tokio::fs::File::create(partial)
        .await
        .map_err(|e| AppError::ModelLoad(format!("Failed to create file {}: {}", partial.display(), e)))?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk)
            .await
            .map_err(|e| AppError::ModelLoad(format!("Failed to write to file: {}", e)))?;
        if let Some(percent) = progress.advance(chunk.len() as u64) {
            emit_progress(events, percent);
        }
    }
    file.flush()
        .await
        .map_err(|e| AppError::ModelLoad(format!("Failed to write to file: {}", e)))
}

fn emit_progress(events: Option<&broadcast::Sender<SessionEvent>>, percent: u8) {
    if let Some(tx) = events {
        // No receivers is fine
        let _ = tx.send(SessionEvent::DownloadProgress { percent });
    }
}
