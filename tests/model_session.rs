mod common;

use common::{manager, png_image, orchestrator, wait_until, MockState};
use image_lens_lib::{AppError, ImageHandle, RawPrediction, SessionState, TOP_K};
use std::sync::Arc;

#[tokio::test]
async fn test_concurrent_get_session_constructs_once() {
    let state = MockState::gated_loads();
    let manager = manager(&state);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move { manager.get_session().await }));
    }

    wait_until(|| state.loads() == 1).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(manager.state(), SessionState::Loading);
    state.release_loads(1);

    let mut sessions = Vec::new();
    for handle in handles {
        sessions.push(handle.await.unwrap().unwrap());
    }
    assert_eq!(state.loads(), 1);
    assert_eq!(manager.load_attempts(), 1);
    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
}

#[tokio::test]
async fn test_concurrent_waiters_share_one_failure() {
    let state = MockState::gated_loads();
    state.fail_next_loads(1);
    let manager = manager(&state);

    let mut handles = Vec::new();
    for _ in 0..5 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move { manager.get_session().await }));
    }
    wait_until(|| state.loads() == 1).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    state.release_loads(1);

    let mut errors = Vec::new();
    for handle in handles {
        errors.push(handle.await.unwrap().err().unwrap());
    }
    assert_eq!(state.loads(), 1);
    assert!(errors.iter().all(|e| e == &errors[0]));
    assert!(matches!(errors[0], AppError::ModelLoad(_)));
    assert_eq!(manager.state(), SessionState::Failed);

    // Next call is free to try again
    state.release_loads(1);
    manager.get_session().await.unwrap();
    assert_eq!(state.loads(), 2);
    assert_eq!(manager.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_end_to_end_returns_engine_ranking_unchanged() {
    let state = MockState::new();
    let orchestrator = orchestrator(&state);

    let results = orchestrator.classify(&png_image("dog.png")).await.unwrap();

    let labels: Vec<&str> = results.iter().map(|r| r.label.as_str()).collect();
    assert_eq!(
        labels,
        vec!["golden retriever", "labrador retriever", "cocker spaniel", "tennis ball", "kuvasz"]
    );
    assert!((results[0].score - 0.92).abs() < 1e-6);
    assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.score) && !r.label.is_empty()));
    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn test_invalid_input_fails_before_model_load() {
    let state = MockState::new();
    let orchestrator = orchestrator(&state);

    let empty = ImageHandle::from_bytes("empty.png", Vec::new());
    let err = orchestrator.classify(&empty).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let garbage = ImageHandle::from_bytes("readme.txt", b"definitely not pixels".to_vec());
    let err = orchestrator.classify(&garbage).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    assert_eq!(state.loads(), 0);
    assert_eq!(orchestrator.manager().state(), SessionState::Uninitialized);
}

#[tokio::test]
async fn test_invalid_path_fails_before_model_load() {
    let dir = tempfile::tempdir().unwrap();
    let empty_file = dir.path().join("empty.jpg");
    std::fs::write(&empty_file, b"").unwrap();

    let state = MockState::new();
    let orchestrator = orchestrator(&state);

    for handle in [
        ImageHandle::from_path(&empty_file),
        ImageHandle::from_path(dir.path()),
        ImageHandle::from_path(dir.path().join("missing.png")),
    ] {
        let err = orchestrator.classify(&handle).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input", "{:?}", handle);
    }
    assert_eq!(state.loads(), 0);
}

#[tokio::test]
async fn test_image_on_disk_is_classified() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dog.png");
    std::fs::write(&path, common::image_bytes(&png_image("dog.png"))).unwrap();

    let state = MockState::new();
    let results = orchestrator(&state).classify(&ImageHandle::from_path(&path)).await.unwrap();
    assert_eq!(results.len(), TOP_K);
    assert_eq!(state.inferred_images.lock().unwrap().as_slice(), ["dog.png"]);
}

#[tokio::test]
async fn test_malformed_engine_output_is_filtered() {
    let state = MockState::new();
    state.set_default_predictions(vec![
        RawPrediction::new("tabby", 0.4),
        RawPrediction {
            label: None,
            score: Some(0.3),
        },
        RawPrediction::new("egyptian cat", 0.5),
        RawPrediction::new("", 0.05),
        RawPrediction::new("lynx", 7.0),
        RawPrediction::new("tiger cat", 0.04),
        RawPrediction::new("persian", 0.03),
        RawPrediction::new("siamese", 0.02),
        RawPrediction::new("cougar", 0.01),
    ]);

    let results = orchestrator(&state).classify(&png_image("cat.png")).await.unwrap();
    let labels: Vec<&str> = results.iter().map(|r| r.label.as_str()).collect();
    assert_eq!(labels, vec!["egyptian cat", "tabby", "tiger cat", "persian", "siamese"]);
}

#[tokio::test]
async fn test_inference_error_keeps_session_ready() {
    let state = MockState::new();
    state.set_infer_error(Some(AppError::Io("device lost".to_string())));
    let orchestrator = orchestrator(&state);

    let err = orchestrator.classify(&png_image("dog.png")).await.unwrap_err();
    assert_eq!(err, AppError::Inference("IO error: device lost".to_string()));
    assert_eq!(orchestrator.manager().state(), SessionState::Ready);

    state.set_infer_error(None);
    orchestrator.classify(&png_image("dog.png")).await.unwrap();
    assert_eq!(state.loads(), 1);
    assert_eq!(state.infers(), 2);
}

#[tokio::test]
async fn test_orchestrator_is_reentrant() {
    let state = MockState::new();
    state.set_predictions_for("cat.png", vec![RawPrediction::new("tabby", 0.8)]);
    let orchestrator = orchestrator(&state);

    let dog = png_image("dog.png");
    let cat = png_image("cat.png");
    let (dogs, cats) = tokio::join!(orchestrator.classify(&dog), orchestrator.classify(&cat));

    assert_eq!(dogs.unwrap()[0].label, "golden retriever");
    assert_eq!(cats.unwrap()[0].label, "tabby");
    assert_eq!(state.loads(), 1);
    assert_eq!(state.infers(), 2);
}
