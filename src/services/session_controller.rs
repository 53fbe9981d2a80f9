//! Coordination between user gestures and the classifier.
//!
//! The controller tracks which image is selected, whether a classification
//! is running for it, and what the presentation layer should show. Every
//! selection gets a fresh token; a classification result is applied only if
//! its token is still the current selection and still marked in flight, so
//! replacing or clearing the image silently drops late results.

use crate::error::AppError;
use crate::models::classify_types::{
    BusyState, ClassificationResult, ClassifyOutcome, ClassifyPhase, SessionEvent, SessionSnapshot, UiState,
};
use crate::models::image_types::ImageHandle;
use crate::services::classifier::engine::EngineLoader;
use crate::services::classifier::orchestrator::Orchestrator;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 64;

struct Selection {
    token: u64,
    image: ImageHandle,
}

struct ControllerState {
    selection: Option<Selection>,
    next_token: u64,
    in_flight: Option<u64>,
    ui_state: UiState,
    busy: BusyState,
    results: Vec<ClassificationResult>,
    error: Option<String>,
}

impl ControllerState {
    fn new() -> Self {
        Self {
            selection: None,
            next_token: 0,
            in_flight: None,
            ui_state: UiState::Idle,
            busy: BusyState::Idle,
            results: Vec::new(),
            error: None,
        }
    }

    fn is_current(&self, token: u64) -> bool {
        self.in_flight == Some(token) && self.selection.as_ref().map(|s| s.token) == Some(token)
    }

    fn transition(&mut self, events: &broadcast::Sender<SessionEvent>, ui_state: UiState, busy: BusyState) {
        if self.ui_state != ui_state {
            debug!(from = ?self.ui_state, to = ?ui_state, "Session state change");
            self.ui_state = ui_state;
            let _ = events.send(SessionEvent::StateChanged { state: ui_state });
        }
        if self.busy != busy {
            self.busy = busy;
            let _ = events.send(SessionEvent::Busy { busy });
        }
    }
}

/// Releases the in-flight marker if a `classify()` future is dropped before
/// it settles, so the selection can be classified again.
struct InFlightGuard<'a> {
    state: &'a Mutex<ControllerState>,
    events: &'a broadcast::Sender<SessionEvent>,
    token: u64,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut st = lock_state(self.state);
        if st.is_current(self.token) {
            debug!(token = self.token, "Classification abandoned before completion");
            st.in_flight = None;
            st.transition(self.events, UiState::ImageSelected, BusyState::Idle);
        }
    }
}

pub struct SessionController<L: EngineLoader> {
    orchestrator: Orchestrator<L>,
    state: Arc<Mutex<ControllerState>>,
    events: broadcast::Sender<SessionEvent>,
}

impl<L: EngineLoader> Clone for SessionController<L> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
            state: self.state.clone(),
            events: self.events.clone(),
        }
    }
}

fn lock_state(state: &Mutex<ControllerState>) -> MutexGuard<'_, ControllerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<L: EngineLoader> SessionController<L> {
    pub fn new(orchestrator: Orchestrator<L>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::with_events(orchestrator, events)
    }

    /// Uses an existing channel, so other components (e.g. the model
    /// downloader) can publish on the same stream.
    pub fn with_events(orchestrator: Orchestrator<L>, events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            orchestrator,
            state: Arc::new(Mutex::new(ControllerState::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn orchestrator(&self) -> &Orchestrator<L> {
        &self.orchestrator
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let st = lock_state(&self.state);
        SessionSnapshot {
            ui_state: st.ui_state,
            busy: st.busy,
            image: st.selection.as_ref().map(|s| s.image.clone()),
            results: st.results.clone(),
            error: st.error.clone(),
        }
    }

    /// Makes `image` the current selection, dropping prior results and
    /// orphaning any classification still running for the old one.
    pub fn select_image(&self, image: ImageHandle) {
        let mut st = lock_state(&self.state);
        st.next_token += 1;
        let token = st.next_token;
        debug!(token, ?image, "Image selected");
        st.selection = Some(Selection { token, image });
        st.in_flight = None;
        st.results.clear();
        st.error = None;
        st.transition(&self.events, UiState::ImageSelected, BusyState::Idle);
    }

    /// Returns to `Idle`. Calling it again does nothing.
    pub fn clear(&self) {
        let mut st = lock_state(&self.state);
        if st.selection.is_none() && st.ui_state == UiState::Idle && st.results.is_empty() && st.error.is_none() {
            return;
        }
        debug!("Selection cleared");
        st.selection = None;
        st.in_flight = None;
        st.results.clear();
        st.error = None;
        st.transition(&self.events, UiState::Idle, BusyState::Idle);
    }

    /// Classifies the current selection.
    ///
    /// Ignored when nothing is selected or a classification for the same
    /// selection is already running. Errors are returned only when they
    /// belong to the still-current selection.
    pub async fn classify(&self) -> Result<ClassifyOutcome, AppError> {
        let (token, image) = {
            let mut st = lock_state(&self.state);
            let (token, image) = match &st.selection {
                Some(sel) => (sel.token, sel.image.clone()),
                None => return Ok(ClassifyOutcome::NoImageSelected),
            };
            if st.in_flight == Some(token) {
                debug!(token, "Classification already in flight, ignoring request");
                return Ok(ClassifyOutcome::AlreadyInFlight);
            }
            st.in_flight = Some(token);
            st.results.clear();
            st.error = None;
            (token, image)
        };

        // Busy phases are reported by the orchestrator once the input is known good
        let mut guard = InFlightGuard {
            state: &self.state,
            events: &self.events,
            token,
            armed: true,
        };
        let state = self.state.clone();
        let events = self.events.clone();
        let result = self
            .orchestrator
            .classify_with(&image, move |phase| {
                let mut st = lock_state(&state);
                if !st.is_current(token) {
                    return;
                }
                match phase {
                    ClassifyPhase::AwaitingModel => {
                        st.transition(&events, UiState::AwaitingModel, BusyState::LoadingModel)
                    }
                    ClassifyPhase::Inferring => st.transition(&events, UiState::Inferring, BusyState::Inferring),
                }
            })
            .await;
        guard.armed = false;

        let mut st = lock_state(&self.state);
        if !st.is_current(token) {
            warn!(token, image = %image.name, "Discarding result for an image that is no longer selected");
            return Ok(ClassifyOutcome::Discarded);
        }
        st.in_flight = None;

        match result {
            Ok(results) => {
                st.results = results.clone();
                st.transition(&self.events, UiState::ResultsReady, BusyState::Idle);
                let _ = self.events.send(SessionEvent::ResultsReady {
                    results: results.clone(),
                });
                Ok(ClassifyOutcome::Delivered(results))
            }
            Err(e) => {
                warn!(image = %image.name, error = %e, "Classification failed");
                st.error = Some(e.to_string());
                st.transition(&self.events, UiState::Errored, BusyState::Idle);
                let _ = self.events.send(SessionEvent::Error {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }
}
