#![allow(dead_code)]

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use image_lens_lib::models::classify_types::DevicePreference;
use image_lens_lib::{
    AppError, EngineLoader, ImageHandle, ImageSource, InferenceSession, ModelManager, ModelSpec, Orchestrator,
    RawPrediction, SessionController,
};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

const OPEN: usize = 1_000;

/// Shared script and call log for a fake inference engine.
pub struct MockState {
    pub loads: AtomicUsize,
    pub infers: AtomicUsize,
    pub load_failures_left: AtomicUsize,
    pub load_gate: Semaphore,
    pub infer_gate: Semaphore,
    pub default_predictions: Mutex<Vec<RawPrediction>>,
    pub predictions_by_image: Mutex<HashMap<String, Vec<RawPrediction>>>,
    pub infer_error: Mutex<Option<AppError>>,
    pub inferred_images: Mutex<Vec<String>>,
}

impl MockState {
    pub fn new() -> Arc<Self> {
        Self::with_gates(OPEN, OPEN)
    }

    /// Loads block until `release_loads` is called.
    pub fn gated_loads() -> Arc<Self> {
        Self::with_gates(0, OPEN)
    }

    /// Inference calls block until `release_infers` is called.
    pub fn gated_infers() -> Arc<Self> {
        Self::with_gates(OPEN, 0)
    }

    fn with_gates(load_permits: usize, infer_permits: usize) -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            infers: AtomicUsize::new(0),
            load_failures_left: AtomicUsize::new(0),
            load_gate: Semaphore::new(load_permits),
            infer_gate: Semaphore::new(infer_permits),
            default_predictions: Mutex::new(dog_predictions()),
            predictions_by_image: Mutex::new(HashMap::new()),
            infer_error: Mutex::new(None),
            inferred_images: Mutex::new(Vec::new()),
        })
    }

    pub fn release_loads(&self, n: usize) {
        self.load_gate.add_permits(n);
    }

    pub fn release_infers(&self, n: usize) {
        self.infer_gate.add_permits(n);
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn infers(&self) -> usize {
        self.infers.load(Ordering::SeqCst)
    }

    pub fn fail_next_loads(&self, n: usize) {
        self.load_failures_left.store(n, Ordering::SeqCst);
    }

    pub fn set_infer_error(&self, err: Option<AppError>) {
        *self.infer_error.lock().unwrap() = err;
    }

    pub fn set_default_predictions(&self, predictions: Vec<RawPrediction>) {
        *self.default_predictions.lock().unwrap() = predictions;
    }

    pub fn set_predictions_for(&self, image: &str, predictions: Vec<RawPrediction>) {
        self.predictions_by_image
            .lock()
            .unwrap()
            .insert(image.to_string(), predictions);
    }
}

pub struct MockLoader(pub Arc<MockState>);

pub struct MockSession(Arc<MockState>);

#[async_trait]
impl EngineLoader for MockLoader {
    type Session = MockSession;

    async fn load(&self, _spec: &ModelSpec) -> Result<MockSession, AppError> {
        self.0.loads.fetch_add(1, Ordering::SeqCst);
        self.0.load_gate.acquire().await.unwrap().forget();

        let fail = self
            .0
            .load_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(AppError::Io("model weights unavailable".to_string()));
        }
        Ok(MockSession(self.0.clone()))
    }
}

#[async_trait]
impl InferenceSession for MockSession {
    async fn infer(&self, image: &ImageHandle, top_k: usize) -> Result<Vec<RawPrediction>, AppError> {
        assert_eq!(top_k, 5);
        self.0.infers.fetch_add(1, Ordering::SeqCst);
        self.0.inferred_images.lock().unwrap().push(image.name.clone());
        self.0.infer_gate.acquire().await.unwrap().forget();

        if let Some(err) = self.0.infer_error.lock().unwrap().clone() {
            return Err(err);
        }
        let by_image = self.0.predictions_by_image.lock().unwrap().get(&image.name).cloned();
        Ok(by_image.unwrap_or_else(|| self.0.default_predictions.lock().unwrap().clone()))
    }
}

pub fn spec() -> ModelSpec {
    ModelSpec {
        model_id: "test/mobilenet".to_string(),
        device: DevicePreference::Gpu,
    }
}

pub fn manager(state: &Arc<MockState>) -> ModelManager<MockLoader> {
    ModelManager::new(MockLoader(state.clone()), spec())
}

pub fn orchestrator(state: &Arc<MockState>) -> Orchestrator<MockLoader> {
    Orchestrator::new(manager(state))
}

pub fn controller(state: &Arc<MockState>) -> SessionController<MockLoader> {
    SessionController::new(orchestrator(state))
}

pub fn dog_predictions() -> Vec<RawPrediction> {
    vec![
        RawPrediction::new("golden retriever", 0.92),
        RawPrediction::new("labrador retriever", 0.05),
        RawPrediction::new("cocker spaniel", 0.01),
        RawPrediction::new("tennis ball", 0.008),
        RawPrediction::new("kuvasz", 0.002),
    ]
}

pub fn png_image(name: &str) -> ImageHandle {
    let img = RgbImage::from_pixel(32, 24, Rgb([180, 140, 60]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    ImageHandle::from_bytes(name, out.into_inner())
}

pub fn image_bytes(handle: &ImageHandle) -> Vec<u8> {
    match &handle.source {
        ImageSource::Bytes(b) => b.to_vec(),
        ImageSource::Path(_) => panic!("expected in-memory image"),
    }
}

/// Yields to spawned tasks until `cond` holds.
pub async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached in time");
}
