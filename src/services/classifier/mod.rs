pub mod engine;
pub mod inference;
pub mod model_manager;
pub mod orchestrator;
pub mod ort_engine;
