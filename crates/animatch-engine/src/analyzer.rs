//! One photo in, one match out.
//!
//! The analyzer sequences a request through the pipeline: decode and bound
//! the upload, locate faces, crop, preprocess for both encoders, embed on the
//! worker, score, and optionally release model memory. Engine failures never
//! fail the request. A missing face engine degrades to CLIP-only scoring; a
//! missing CLIP engine degrades to a random match.

use crate::state::{EngineStates, EngineStatus};
use crate::worker::{WorkerError, WorkerHandle};
use animatch_core::embedder::EngineError;
use animatch_core::face::{
    crop_face, locate_faces, FaceLocator, FacePolicy, DEFAULT_DETECT_MAX_DIM, DEFAULT_FACE_PADDING,
};
use animatch_core::matching::MatchError;
use animatch_core::preprocess::{
    decode_image, limit_dimensions, preprocess, PreprocessError, FACE_PREPROCESS, GENERAL_PREPROCESS,
};
use animatch_core::{
    AnalysisSummary, Catalog, DetectedFace, Embedding, EngineKind, MatchQuery, MatchResult, Orientation,
    ScoringEngine, VariantConfig,
};
use image::DynamicImage;
use ndarray::Array4;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Larger-side ceiling applied to uploads before anything else.
pub const DEFAULT_UPLOAD_MAX_DIM: u32 = 1080;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("image: {0}")]
    Image(#[from] PreprocessError),
    #[error("matching: {0}")]
    Match(#[from] MatchError),
}

#[derive(Debug, Clone)]
pub struct AnalyzerOptions {
    pub upload_max_dim: u32,
    pub detect_max_dim: u32,
    pub face_padding: f32,
    /// Submit both embedding requests before awaiting either.
    pub concurrent_inference: bool,
    /// Release both model sessions after every match.
    pub release_after_match: bool,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            upload_max_dim: DEFAULT_UPLOAD_MAX_DIM,
            detect_max_dim: DEFAULT_DETECT_MAX_DIM,
            face_padding: DEFAULT_FACE_PADDING,
            concurrent_inference: false,
            release_after_match: false,
        }
    }
}

pub enum ImageInput {
    /// Encoded bytes (JPEG, PNG, WebP, ...).
    Encoded(Vec<u8>),
    Decoded(DynamicImage),
}

/// How the face for a request is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FaceSelection {
    /// Run the detector; one face is cropped automatically.
    Detect,
    /// Use this region, typically picked by the user among several faces.
    Region(DetectedFace),
    /// Embed the whole photo without face handling.
    Skip,
}

pub struct AnalysisRequest {
    pub image: ImageInput,
    pub orientation: Orientation,
    pub face: FaceSelection,
}

impl AnalysisRequest {
    pub fn new(image: ImageInput, orientation: Orientation) -> Self {
        Self { image, orientation, face: FaceSelection::Detect }
    }

    pub fn with_face(mut self, face: FaceSelection) -> Self {
        self.face = face;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Analysis {
    pub result: MatchResult,
    pub summary: AnalysisSummary,
    /// The face region the embeddings were taken from.
    pub face: Option<DetectedFace>,
}

#[derive(Debug)]
pub enum AnalysisOutcome {
    Matched(Analysis),
    /// Several faces and no selection: ask the user, then resubmit with
    /// [`FaceSelection::Region`].
    MultipleFaces(Vec<DetectedFace>),
    /// The request was cancelled while in flight.
    Discarded,
}

/// Invalidates every analysis in flight when cancelled.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    generation: Arc<AtomicU64>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let previous = self.generation.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(generation = previous + 1, "analysis cancelled");
    }
}

pub struct Analyzer {
    worker: WorkerHandle,
    locator: Option<Box<dyn FaceLocator + Send>>,
    catalog: Arc<Catalog>,
    scoring: ScoringEngine,
    variant: Option<VariantConfig>,
    variant_label: Option<String>,
    states: EngineStates,
    options: AnalyzerOptions,
    generation: Arc<AtomicU64>,
    rng: StdRng,
}

impl Analyzer {
    pub fn new(worker: WorkerHandle, catalog: Arc<Catalog>) -> Self {
        Self {
            worker,
            locator: None,
            catalog,
            scoring: ScoringEngine::default(),
            variant: None,
            variant_label: None,
            states: EngineStates::default(),
            options: AnalyzerOptions::default(),
            generation: Arc::new(AtomicU64::new(0)),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_locator(mut self, locator: Box<dyn FaceLocator + Send>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn with_scoring(mut self, scoring: ScoringEngine) -> Self {
        self.scoring = scoring;
        self.warn_shadowed();
        self
    }

    /// Session variant; fixed for the analyzer's lifetime. Its weights take
    /// precedence over the scoring params.
    pub fn with_variant(mut self, label: Option<String>, config: Option<VariantConfig>) -> Self {
        self.variant_label = label;
        self.variant = config;
        self.warn_shadowed();
        self
    }

    fn warn_shadowed(&self) {
        let Some(variant) = &self.variant else { return };
        let shadowed = self.scoring.params().shadowed_by(variant);
        if !shadowed.is_empty() {
            tracing::warn!(
                variant = self.variant_label.as_deref().unwrap_or("unlabelled"),
                fields = ?shadowed,
                "experiment variant overrides configured scoring params"
            );
        }
    }

    pub fn with_options(mut self, options: AnalyzerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle { generation: Arc::clone(&self.generation) }
    }

    pub fn states(&self) -> &EngineStates {
        &self.states
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn variant_label(&self) -> Option<&str> {
        self.variant_label.as_deref()
    }

    /// Faces in `image`, in its own coordinates. Detector failures read as
    /// "no face".
    pub fn detect_faces(&mut self, image: &DynamicImage) -> Vec<DetectedFace> {
        let Some(locator) = self.locator.as_mut() else {
            return Vec::new();
        };
        match locate_faces(locator.as_mut(), image, self.options.detect_max_dim) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed; continuing without a face");
                Vec::new()
            }
        }
    }

    /// Random fallback without touching the engines.
    pub fn random_match(&mut self, orientation: Orientation) -> Result<MatchResult, MatchError> {
        self.scoring
            .random_match(orientation, self.catalog.characters(), &mut self.rng)
    }

    /// Drop both model sessions. The next analysis re-initializes them.
    pub async fn release(&mut self) -> Result<(), WorkerError> {
        self.worker.release_all().await?;
        self.states.reset();
        Ok(())
    }

    pub async fn analyze(&mut self, request: AnalysisRequest) -> Result<AnalysisOutcome, AnalysisError> {
        let generation = self.generation.load(Ordering::SeqCst);
        let orientation = request.orientation;

        let image = match request.image {
            ImageInput::Encoded(bytes) => decode_image(&bytes)?,
            ImageInput::Decoded(image) => image,
        };
        let image = limit_dimensions(image, self.options.upload_max_dim);

        let (face, faces_detected) = match request.face {
            FaceSelection::Skip => (None, 0),
            FaceSelection::Region(face) => (Some(face), 1),
            FaceSelection::Detect => {
                let faces = self.detect_faces(&image);
                let count = faces.len();
                match FacePolicy::decide(faces) {
                    FacePolicy::NoFace => (None, 0),
                    FacePolicy::AutoCrop(face) => (Some(face), count),
                    FacePolicy::Ambiguous(faces) => {
                        tracing::info!(faces = count, "multiple faces; selection required");
                        return Ok(AnalysisOutcome::MultipleFaces(faces));
                    }
                }
            }
        };

        let crop = face.and_then(|f| match crop_face(&image, &f, self.options.face_padding) {
            Ok(crop) => Some(crop),
            Err(e) => {
                tracing::warn!(error = %e, face = ?f, "face crop failed; using whole photo");
                None
            }
        });
        let has_face = crop.is_some();
        let subject = crop.as_ref().unwrap_or(&image);

        let general_tensor = preprocess(subject, &GENERAL_PREPROCESS)?;
        let face_tensor = if has_face {
            preprocess(subject, &FACE_PREPROCESS)
                .map_err(|e| tracing::warn!(error = %e, "face preprocessing failed"))
                .ok()
        } else {
            None
        };

        let general_job = self
            .ensure_ready(EngineKind::General)
            .await
            .then_some(general_tensor);
        let face_job = match face_tensor {
            Some(tensor) => self.ensure_ready(EngineKind::Face).await.then_some(tensor),
            None => None,
        };

        let (general, face_embedding) = if self.options.concurrent_inference {
            tokio::join!(
                run_engine(&self.worker, EngineKind::General, general_job),
                run_engine(&self.worker, EngineKind::Face, face_job),
            )
        } else {
            let general = run_engine(&self.worker, EngineKind::General, general_job).await;
            let face = run_engine(&self.worker, EngineKind::Face, face_job).await;
            (general, face)
        };
        let general = self.settle(EngineKind::General, general);
        let face_embedding = self.settle(EngineKind::Face, face_embedding);

        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(generation, "discarding stale analysis");
            self.release_if_configured().await;
            return Ok(AnalysisOutcome::Discarded);
        }

        let result = match &general {
            Some(general) => {
                let query = MatchQuery {
                    general,
                    face: face_embedding.as_ref(),
                    orientation,
                    has_face,
                };
                match self
                    .scoring
                    .find_best(&query, self.catalog.characters(), self.variant.as_ref())
                {
                    Ok(result) => result,
                    Err(MatchError::DimensionMismatch { expected, got }) => {
                        tracing::warn!(expected, got, "embedding does not fit the catalog; random match");
                        self.random_match(orientation)?
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            None => {
                tracing::warn!("no CLIP embedding; random match");
                self.random_match(orientation)?
            }
        };

        self.release_if_configured().await;

        let summary = result.summary(self.variant_label.as_deref(), faces_detected);
        tracing::info!(
            character = summary.character_id,
            percent = summary.percent,
            confidence = %summary.confidence,
            mode = %summary.mode,
            faces = faces_detected,
            "analysis complete"
        );

        Ok(AnalysisOutcome::Matched(Analysis {
            result,
            summary,
            face: if has_face { face } else { None },
        }))
    }

    /// Load the engine on first use. `false` means skip it for this request.
    async fn ensure_ready(&mut self, kind: EngineKind) -> bool {
        match self.states.get(kind) {
            EngineStatus::Ready => true,
            EngineStatus::Failed => false,
            EngineStatus::Uninitialized => match self.worker.init(kind, None).await {
                Ok(path) => {
                    tracing::info!(engine = %kind, path, "engine initialized");
                    self.states.mark_ready(kind);
                    true
                }
                Err(e) => {
                    tracing::warn!(engine = %kind, error = %e, "engine init failed");
                    if matches!(e, WorkerError::Crashed { .. }) {
                        self.states.reset();
                    }
                    self.states.mark_failed(kind);
                    false
                }
            },
        }
    }

    async fn release_if_configured(&mut self) {
        if !self.options.release_after_match {
            return;
        }
        if let Err(e) = self.release().await {
            tracing::warn!(error = %e, "releasing engines after match failed");
        }
    }

    fn settle(
        &mut self,
        kind: EngineKind,
        outcome: Option<Result<Embedding, WorkerError>>,
    ) -> Option<Embedding> {
        match outcome? {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                tracing::warn!(engine = %kind, error = %e, "embedding failed; engine skipped for this request");
                match e {
                    // A crash releases every session on the worker.
                    WorkerError::Crashed { .. } => self.states.reset(),
                    WorkerError::Engine(EngineError::ModelNotLoaded(_)) => self.states.mark_uninitialized(kind),
                    _ => {}
                }
                None
            }
        }
    }
}

async fn run_engine(
    worker: &WorkerHandle,
    kind: EngineKind,
    tensor: Option<Array4<f32>>,
) -> Option<Result<Embedding, WorkerError>> {
    match tensor {
        Some(tensor) => Some(worker.embed(kind, tensor).await),
        None => None,
    }
}
