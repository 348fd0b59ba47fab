//! End-to-end analysis against fake inference backends.
//!
//! The fake models embed an image as its per-channel means after
//! preprocessing, so a solid-color photo embeds exactly like a catalog entry
//! built from the same color.

use animatch_core::detector::DetectorError;
use animatch_core::embedder::{InferenceBackend, ModelLoader};
use animatch_core::face::FaceLocator;
use animatch_core::matching::MatchError;
use animatch_core::preprocess::{PreprocessSpec, FACE_PREPROCESS, GENERAL_PREPROCESS};
use animatch_core::{Catalog, Confidence, DetectedFace, Embedding, EngineKind, MatchMode, Orientation};
use animatch_engine::{
    spawn_worker, AnalysisError, AnalysisOutcome, AnalysisRequest, Analyzer, AnalyzerOptions, CancelHandle,
    EngineStatus, FaceSelection, ImageInput, WorkerSettings,
};
use image::{DynamicImage, Rgb, RgbImage};
use ndarray::{s, ArrayView4};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const RED: [u8; 3] = [255, 0, 0];
const GREEN: [u8; 3] = [0, 255, 0];
const BLUE: [u8; 3] = [0, 0, 255];

struct MeanBackend {
    dims: usize,
    panics: bool,
    /// Forward passes left that return an error.
    errors: Arc<AtomicUsize>,
}

impl InferenceBackend for MeanBackend {
    fn forward(&mut self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, String> {
        if self.panics {
            panic!("face model blew up");
        }
        if self
            .errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err("transient runtime error".into());
        }
        let means: Vec<f32> = (0..3)
            .map(|c| input.slice(s![0, c, .., ..]).mean().unwrap_or(0.0))
            .collect();
        Ok(means.into_iter().cycle().take(self.dims).collect())
    }
}

#[derive(Default)]
struct FakeLoader {
    fail_general: bool,
    fail_face: bool,
    panic_face: bool,
    /// Dimension of general embeddings; 0 means 3.
    general_dims: usize,
    /// Failing forward passes for each model.
    general_errors: Arc<AtomicUsize>,
    face_errors: Arc<AtomicUsize>,
    cancel_on_load: Mutex<Option<CancelHandle>>,
    loads: AtomicUsize,
}

impl ModelLoader for FakeLoader {
    fn load(&self, model_path: &str) -> Result<Box<dyn InferenceBackend>, String> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.cancel_on_load.lock().unwrap().as_ref() {
            handle.cancel();
        }

        let is_face = model_path.contains("face");
        if (is_face && self.fail_face) || (!is_face && self.fail_general) {
            return Err(format!("cannot open {model_path}"));
        }
        let dims = match (is_face, self.general_dims) {
            (true, _) => 2,
            (false, 0) => 3,
            (false, d) => d,
        };
        let errors = Arc::clone(if is_face { &self.face_errors } else { &self.general_errors });
        Ok(Box::new(MeanBackend { dims, panics: is_face && self.panic_face, errors }))
    }
}

struct StubLocator {
    faces: Vec<DetectedFace>,
}

impl FaceLocator for StubLocator {
    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<DetectedFace>, DetectorError> {
        Ok(self.faces.clone())
    }
}

fn face_box(x: f32) -> DetectedFace {
    DetectedFace { x, y: 60.0, width: 60.0, height: 60.0, confidence: 0.95 }
}

/// What the fake model produces for a solid color.
fn embed_color(color: [u8; 3], spec: &PreprocessSpec, dims: usize) -> Vec<f32> {
    let raw: Vec<f32> = (0..3)
        .map(|c| (color[c] as f32 / 255.0 - spec.mean[c]) / spec.std[c])
        .cycle()
        .take(dims)
        .collect();
    Embedding::normalized(raw).unwrap().values().to_vec()
}

fn catalog() -> Arc<Catalog> {
    let entry = |id: u32, color: [u8; 3], with_face: bool| {
        let face = with_face.then(|| embed_color(color, &FACE_PREPROCESS, 2));
        json!({
            "heroine_id": id,
            "heroine_name": format!("character-{id}"),
            "anime": "test",
            "orientation": "female",
            "tier": 2,
            "embedding": embed_color(color, &GENERAL_PREPROCESS, 3),
            "arcface_embedding": face,
        })
    };
    let doc = json!({
        "model": "fake-mean",
        "embedding_dim": 3,
        "count": 3,
        "characters": [entry(1, RED, true), entry(2, BLUE, true), entry(3, GREEN, false)],
    });
    Arc::new(Catalog::from_bytes(doc.to_string().as_bytes()).unwrap())
}

fn settings() -> WorkerSettings {
    WorkerSettings {
        general_model: "clip-q8.onnx".into(),
        general_fallbacks: vec![],
        face_model: "mobilefacenet-q8.onnx".into(),
    }
}

fn analyzer(loader: &Arc<FakeLoader>, faces: Option<Vec<DetectedFace>>) -> Analyzer {
    let worker = spawn_worker(Arc::clone(loader) as Arc<dyn ModelLoader>, settings()).unwrap();
    let analyzer = Analyzer::new(worker, catalog()).with_rng(StdRng::seed_from_u64(1));
    match faces {
        Some(faces) => analyzer.with_locator(Box::new(StubLocator { faces })),
        None => analyzer,
    }
}

fn photo(color: [u8; 3]) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 200, Rgb(color)))
}

fn request(color: [u8; 3]) -> AnalysisRequest {
    AnalysisRequest::new(ImageInput::Decoded(photo(color)), Orientation::Female)
}

fn matched(outcome: AnalysisOutcome) -> animatch_engine::Analysis {
    match outcome {
        AnalysisOutcome::Matched(analysis) => analysis,
        other => panic!("expected a match, got {other:?}"),
    }
}

#[tokio::test]
async fn test_no_face_scores_on_clip_only() {
    let loader = Arc::new(FakeLoader::default());
    let mut analyzer = analyzer(&loader, None);

    let analysis = matched(analyzer.analyze(request(RED)).await.unwrap());
    assert_eq!(analysis.result.character().id, 1);
    assert_eq!(analysis.result.mode, MatchMode::General);
    assert!((analysis.result.score() - 1.0).abs() < 1e-4);
    assert_eq!(analysis.summary.faces_detected, 0);
    assert!(analysis.face.is_none());
    assert_eq!(analysis.result.top_n().len(), 3);

    assert_eq!(analyzer.states().get(EngineKind::General), EngineStatus::Ready);
    assert_eq!(analyzer.states().get(EngineKind::Face), EngineStatus::Uninitialized);
}

#[tokio::test]
async fn test_single_face_is_dual_with_bonus() {
    let loader = Arc::new(FakeLoader::default());
    let mut with_face = analyzer(&loader, Some(vec![face_box(70.0)]));
    let mut without_face = analyzer(&loader, None);

    let dual = matched(with_face.analyze(request(RED)).await.unwrap());
    assert_eq!(dual.result.mode, MatchMode::Dual);
    assert_eq!(dual.result.character().id, 1);
    assert_eq!(dual.face, Some(face_box(70.0)));
    assert_eq!(dual.summary.faces_detected, 1);
    assert_eq!(dual.result.confidence, Confidence::High);
    assert!(dual.result.best().face_similarity.unwrap() > 0.99);

    let general = matched(without_face.analyze(request(RED)).await.unwrap());
    assert!(dual.result.percent() > general.result.percent());
    assert!((50..=97).contains(&dual.result.percent()));
}

#[tokio::test]
async fn test_multiple_faces_need_selection() {
    let loader = Arc::new(FakeLoader::default());
    let mut analyzer = analyzer(&loader, Some(vec![face_box(10.0), face_box(120.0)]));

    let faces = match analyzer.analyze(request(BLUE)).await.unwrap() {
        AnalysisOutcome::MultipleFaces(faces) => faces,
        other => panic!("expected MultipleFaces, got {other:?}"),
    };
    assert_eq!(faces.len(), 2);
    // Nothing was loaded for an ambiguous request.
    assert_eq!(loader.loads.load(Ordering::SeqCst), 0);

    let analysis = matched(
        analyzer
            .analyze(request(BLUE).with_face(FaceSelection::Region(faces[1])))
            .await
            .unwrap(),
    );
    assert_eq!(analysis.result.character().id, 2);
    assert_eq!(analysis.result.mode, MatchMode::Dual);
    assert_eq!(analysis.face, Some(faces[1]));
}

#[tokio::test]
async fn test_general_engine_failure_falls_back_to_random() {
    let loader = Arc::new(FakeLoader { fail_general: true, ..Default::default() });
    let mut analyzer = analyzer(&loader, Some(vec![face_box(70.0)]));

    let analysis = matched(analyzer.analyze(request(RED)).await.unwrap());
    assert_eq!(analysis.result.mode, MatchMode::Random);
    assert_eq!(analysis.result.confidence, Confidence::Low);
    assert!((55..=80).contains(&analysis.result.percent()));
    assert_eq!(analyzer.states().get(EngineKind::General), EngineStatus::Failed);

    // A failed engine is not retried within the session.
    let loads = loader.loads.load(Ordering::SeqCst);
    matched(analyzer.analyze(request(RED)).await.unwrap());
    assert_eq!(loader.loads.load(Ordering::SeqCst), loads);
}

#[tokio::test]
async fn test_face_engine_failure_degrades_to_general() {
    let loader = Arc::new(FakeLoader { fail_face: true, ..Default::default() });
    let mut analyzer = analyzer(&loader, Some(vec![face_box(70.0)]));

    let analysis = matched(analyzer.analyze(request(GREEN)).await.unwrap());
    assert_eq!(analysis.result.mode, MatchMode::General);
    assert_eq!(analysis.result.character().id, 3);
    assert_eq!(analyzer.states().get(EngineKind::Face), EngineStatus::Failed);
    assert_eq!(analyzer.states().get(EngineKind::General), EngineStatus::Ready);
}

#[tokio::test]
async fn test_face_engine_crash_degrades_and_recovers() {
    let loader = Arc::new(FakeLoader { panic_face: true, ..Default::default() });
    let mut analyzer = analyzer(&loader, Some(vec![face_box(70.0)]));

    let analysis = matched(analyzer.analyze(request(RED)).await.unwrap());
    assert_eq!(analysis.result.mode, MatchMode::General);
    assert_eq!(analysis.result.character().id, 1);
    // The crash released both sessions; both reload on the next request.
    assert_eq!(analyzer.states().get(EngineKind::General), EngineStatus::Uninitialized);
    assert_eq!(analyzer.states().get(EngineKind::Face), EngineStatus::Uninitialized);
    assert_eq!(loader.loads.load(Ordering::SeqCst), 2);

    let again = matched(analyzer.analyze(request(RED)).await.unwrap());
    assert_eq!(again.result.mode, MatchMode::General);
    assert_eq!(again.result.character().id, 1);
    assert_eq!(loader.loads.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_inference_error_only_affects_one_request() {
    let loader = Arc::new(FakeLoader {
        general_errors: Arc::new(AtomicUsize::new(1)),
        ..Default::default()
    });
    let mut analyzer = analyzer(&loader, None);

    let first = matched(analyzer.analyze(request(RED)).await.unwrap());
    assert_eq!(first.result.mode, MatchMode::Random);
    assert_eq!(analyzer.states().get(EngineKind::General), EngineStatus::Ready);

    let second = matched(analyzer.analyze(request(RED)).await.unwrap());
    assert_eq!(second.result.mode, MatchMode::General);
    assert_eq!(second.result.character().id, 1);
    // The session survived the error, so nothing was reloaded.
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_face_inference_error_keeps_dual_mode_for_next_request() {
    let loader = Arc::new(FakeLoader {
        face_errors: Arc::new(AtomicUsize::new(1)),
        ..Default::default()
    });
    let mut analyzer = analyzer(&loader, Some(vec![face_box(70.0)]));

    let first = matched(analyzer.analyze(request(RED)).await.unwrap());
    assert_eq!(first.result.mode, MatchMode::General);
    assert_eq!(first.result.character().id, 1);

    let second = matched(analyzer.analyze(request(RED)).await.unwrap());
    assert_eq!(second.result.mode, MatchMode::Dual);
    assert_eq!(analyzer.states().get(EngineKind::Face), EngineStatus::Ready);
}

#[tokio::test]
async fn test_dimension_mismatch_falls_back_to_random() {
    let loader = Arc::new(FakeLoader { general_dims: 4, ..Default::default() });
    let mut analyzer = analyzer(&loader, None);

    let analysis = matched(analyzer.analyze(request(RED)).await.unwrap());
    assert_eq!(analysis.result.mode, MatchMode::Random);
}

#[tokio::test]
async fn test_release_after_match_reloads_each_time() {
    let loader = Arc::new(FakeLoader::default());
    let mut analyzer = analyzer(&loader, Some(vec![face_box(70.0)])).with_options(AnalyzerOptions {
        release_after_match: true,
        ..Default::default()
    });

    matched(analyzer.analyze(request(RED)).await.unwrap());
    assert_eq!(analyzer.states().get(EngineKind::General), EngineStatus::Uninitialized);
    assert_eq!(loader.loads.load(Ordering::SeqCst), 2);

    let second = matched(analyzer.analyze(request(RED)).await.unwrap());
    assert_eq!(second.result.mode, MatchMode::Dual);
    assert_eq!(loader.loads.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_cancelled_analysis_is_discarded() {
    let loader = Arc::new(FakeLoader::default());
    let mut analyzer = analyzer(&loader, None);
    *loader.cancel_on_load.lock().unwrap() = Some(analyzer.cancel_handle());

    let outcome = analyzer.analyze(request(RED)).await.unwrap();
    assert!(matches!(outcome, AnalysisOutcome::Discarded));

    // Engines are loaded now, so the next request does not cancel itself.
    let analysis = matched(analyzer.analyze(request(RED)).await.unwrap());
    assert_eq!(analysis.result.character().id, 1);
}

#[tokio::test]
async fn test_cancelled_analysis_still_releases_engines() {
    let loader = Arc::new(FakeLoader::default());
    let mut analyzer = analyzer(&loader, None).with_options(AnalyzerOptions {
        release_after_match: true,
        ..Default::default()
    });
    *loader.cancel_on_load.lock().unwrap() = Some(analyzer.cancel_handle());

    let outcome = analyzer.analyze(request(RED)).await.unwrap();
    assert!(matches!(outcome, AnalysisOutcome::Discarded));
    assert_eq!(analyzer.states().get(EngineKind::General), EngineStatus::Uninitialized);
}

#[tokio::test]
async fn test_concurrent_inference_matches_sequential() {
    let loader = Arc::new(FakeLoader::default());
    let mut sequential = analyzer(&loader, Some(vec![face_box(70.0)]));
    let mut concurrent = analyzer(&loader, Some(vec![face_box(70.0)])).with_options(AnalyzerOptions {
        concurrent_inference: true,
        ..Default::default()
    });

    let a = matched(sequential.analyze(request(BLUE)).await.unwrap());
    let b = matched(concurrent.analyze(request(BLUE)).await.unwrap());
    assert_eq!(a.result.character().id, b.result.character().id);
    assert_eq!(a.result.score(), b.result.score());
    assert_eq!(a.result.percent(), b.result.percent());
    assert_eq!(a.result.mode, b.result.mode);
}

#[tokio::test]
async fn test_encoded_input_and_variant_label() {
    let loader = Arc::new(FakeLoader::default());
    let mut analyzer = analyzer(&loader, None)
        .with_variant(Some("matching-weights-v2:control".into()), None);

    let mut png = Vec::new();
    photo(GREEN)
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .unwrap();
    let req = AnalysisRequest::new(ImageInput::Encoded(png), Orientation::Female)
        .with_face(FaceSelection::Skip);

    let analysis = matched(analyzer.analyze(req).await.unwrap());
    assert_eq!(analysis.result.character().id, 3);
    assert_eq!(analysis.summary.variant.as_deref(), Some("matching-weights-v2:control"));
    assert_eq!(analysis.summary.runners_up.len(), 2);
}

#[tokio::test]
async fn test_empty_pool_and_bad_image_surface() {
    let loader = Arc::new(FakeLoader::default());
    let mut analyzer = analyzer(&loader, None);

    let male = AnalysisRequest::new(ImageInput::Decoded(photo(RED)), Orientation::Male);
    assert!(matches!(
        analyzer.analyze(male).await,
        Err(AnalysisError::Match(MatchError::EmptyPool(Orientation::Male)))
    ));

    let garbage = AnalysisRequest::new(ImageInput::Encoded(b"not an image".to_vec()), Orientation::Female);
    assert!(matches!(analyzer.analyze(garbage).await, Err(AnalysisError::Image(_))));
}
