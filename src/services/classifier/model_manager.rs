use crate::error::AppError;
use crate::models::classify_types::{ModelSpec, ModelStatus, SessionState};
use crate::services::classifier::engine::EngineLoader;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

type LoadFuture<S> = Shared<BoxFuture<'static, Result<Arc<S>, AppError>>>;

enum Slot<S> {
    Uninitialized,
    Loading { attempt: u64, future: LoadFuture<S> },
    Ready(Arc<S>),
    Failed(AppError),
}

/// Owns the one inference session of the process.
///
/// The first `get_session` call starts construction; every caller that
/// arrives while it is in flight awaits the same shared future, so the
/// loader runs at most once per attempt. A failed attempt is remembered
/// for status reporting but the next call starts a fresh one.
pub struct ModelManager<L: EngineLoader> {
    loader: Arc<L>,
    spec: ModelSpec,
    slot: Arc<Mutex<Slot<L::Session>>>,
    attempts: Arc<AtomicU64>,
}

impl<L: EngineLoader> Clone for ModelManager<L> {
    fn clone(&self) -> Self {
        Self {
            loader: self.loader.clone(),
            spec: self.spec.clone(),
            slot: self.slot.clone(),
            attempts: self.attempts.clone(),
        }
    }
}

impl<L: EngineLoader> ModelManager<L> {
    pub fn new(loader: L, spec: ModelSpec) -> Self {
        Self {
            loader: Arc::new(loader),
            spec,
            slot: Arc::new(Mutex::new(Slot::Uninitialized)),
            attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot<L::Session>> {
        // Critical sections never panic, so a poisoned lock still holds a valid slot.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        match &*self.lock_slot() {
            Slot::Uninitialized => SessionState::Uninitialized,
            Slot::Loading { .. } => SessionState::Loading,
            Slot::Ready(_) => SessionState::Ready,
            Slot::Failed(_) => SessionState::Failed,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn status(&self) -> ModelStatus {
        let slot = self.lock_slot();
        let (state, error) = match &*slot {
            Slot::Uninitialized => (SessionState::Uninitialized, None),
            Slot::Loading { .. } => (SessionState::Loading, None),
            Slot::Ready(_) => (SessionState::Ready, None),
            Slot::Failed(e) => (SessionState::Failed, Some(e.to_string())),
        };
        ModelStatus { state, error }
    }

    /// Number of constructions started so far.
    pub fn load_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn get_session(&self) -> Result<Arc<L::Session>, AppError> {
        let (attempt, future) = {
            let mut slot = self.lock_slot();
            let joined = match &*slot {
                Slot::Ready(session) => return Ok(session.clone()),
                Slot::Loading { attempt, future } => Some((*attempt, future.clone())),
                Slot::Uninitialized | Slot::Failed(_) => None,
            };
            match joined {
                Some((attempt, future)) => {
                    debug!(attempt, "Joining in-flight model load");
                    (attempt, future)
                }
                None => {
                    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let future = self.start_load(attempt);
                    *slot = Slot::Loading {
                        attempt,
                        future: future.clone(),
                    };
                    (attempt, future)
                }
            }
        };

        let result = future.await;
        self.settle(attempt, &result);
        result
    }

    /// Warms the session eagerly so the first classification does not pay for it.
    pub async fn preload(&self) -> Result<(), AppError> {
        self.get_session().await.map(|_| ())
    }

    fn start_load(&self, attempt: u64) -> LoadFuture<L::Session> {
        let loader = self.loader.clone();
        let spec = self.spec.clone();
        async move {
            info!(model = %spec.model_id, device = ?spec.device, attempt, "Loading image classification model");
            let started = Instant::now();
            match loader.load(&spec).await {
                Ok(session) => {
                    info!(
                        model = %spec.model_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Model loaded successfully"
                    );
                    Ok(Arc::new(session))
                }
                Err(e) => {
                    let e = e.into_model_load();
                    warn!(model = %spec.model_id, attempt, error = %e, "Model load failed");
                    Err(e)
                }
            }
        }
        .boxed()
        .shared()
    }

    fn settle(&self, attempt: u64, result: &Result<Arc<L::Session>, AppError>) {
        let mut slot = self.lock_slot();
        let current = matches!(&*slot, Slot::Loading { attempt: a, .. } if *a == attempt);
        if !current {
            return;
        }
        *slot = match result {
            Ok(session) => Slot::Ready(session.clone()),
            Err(e) => Slot::Failed(e.clone()),
        };
    }
}
