pub mod classifier;
pub mod session_controller;
