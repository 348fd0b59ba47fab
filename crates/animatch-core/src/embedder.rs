//! Embedding engines for the CLIP image encoder and the ArcFace face encoder.
//!
//! Each engine wraps one inference session behind [`InferenceBackend`] and
//! owns its lifecycle explicitly: `init` loads (with optional fallback
//! artifacts), `embed` runs one forward pass and L2-normalizes, `release`
//! drops the session so model memory is reclaimed immediately.

use crate::preprocess::{PreprocessSpec, FACE_PREPROCESS, GENERAL_PREPROCESS};
use crate::types::Embedding;
use ndarray::{Array4, ArrayView4};
use ort::session::Session;
use ort::value::TensorRef;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{engine} model load failed ({path}): {reason}")]
    ModelLoad {
        engine: EngineKind,
        path: String,
        reason: String,
    },
    #[error("{0} model not loaded, call init first")]
    ModelNotLoaded(EngineKind),
    #[error("{engine} inference failed: {reason}")]
    Inference { engine: EngineKind, reason: String },
}

/// Which of the two embedding spaces an engine produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// General vision encoder (CLIP).
    General,
    /// Face-recognition encoder (ArcFace / MobileFaceNet).
    Face,
}

impl EngineKind {
    pub fn preprocess_spec(&self) -> &'static PreprocessSpec {
        match self {
            EngineKind::General => &GENERAL_PREPROCESS,
            EngineKind::Face => &FACE_PREPROCESS,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::General => f.write_str("CLIP"),
            EngineKind::Face => f.write_str("ArcFace"),
        }
    }
}

/// One loaded model: a raw forward pass, no normalization.
pub trait InferenceBackend: Send {
    fn forward(&mut self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, String>;
}

/// Opens inference backends from model artifact paths.
pub trait ModelLoader: Send + Sync {
    fn load(&self, model_path: &str) -> Result<Box<dyn InferenceBackend>, String>;
}

/// ONNX Runtime loader. Keep `intra_threads` at 1 on memory-constrained hosts.
#[derive(Debug, Clone, Copy)]
pub struct OrtLoader {
    pub intra_threads: usize,
}

impl Default for OrtLoader {
    fn default() -> Self {
        Self { intra_threads: 1 }
    }
}

impl ModelLoader for OrtLoader {
    fn load(&self, model_path: &str) -> Result<Box<dyn InferenceBackend>, String> {
        if !Path::new(model_path).exists() {
            return Err(format!("model file not found: {model_path}"));
        }
        let session = open_session(model_path, self.intra_threads).map_err(|e| e.to_string())?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ONNX model"
        );

        Ok(Box::new(OrtBackend { session }))
    }
}

fn open_session(model_path: &str, intra_threads: usize) -> Result<Session, ort::Error> {
    let session = Session::builder()?
        .with_intra_threads(intra_threads)?
        .commit_from_file(model_path)?;
    Ok(session)
}

struct OrtBackend {
    session: Session,
}

impl InferenceBackend for OrtBackend {
    fn forward(&mut self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, String> {
        let tensor = TensorRef::from_array_view(input).map_err(|e| e.to_string())?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| e.to_string())?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| format!("embedding extraction: {e}"))?;

        Ok(raw.to_vec())
    }
}

/// An embedding engine with an explicit init/embed/release lifecycle.
pub struct EmbeddingEngine {
    kind: EngineKind,
    loader: Arc<dyn ModelLoader>,
    /// Artifacts tried after the requested path fails, in order.
    fallbacks: Vec<String>,
    backend: Option<Box<dyn InferenceBackend>>,
    loaded_from: Option<String>,
}

impl EmbeddingEngine {
    pub fn new(kind: EngineKind, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            kind,
            loader,
            fallbacks: Vec::new(),
            backend: None,
            loaded_from: None,
        }
    }

    /// Add a fallback artifact, tried when the requested one fails to load.
    pub fn with_fallback(mut self, model_path: impl Into<String>) -> Self {
        self.fallbacks.push(model_path.into());
        self
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn is_ready(&self) -> bool {
        self.backend.is_some()
    }

    /// Path of the artifact currently loaded.
    pub fn loaded_from(&self) -> Option<&str> {
        self.loaded_from.as_deref()
    }

    /// Load the model. Safe to call when already loaded.
    pub fn init(&mut self, model_path: &str) -> Result<(), EngineError> {
        if self.backend.is_some() {
            return Ok(());
        }

        let candidates: Vec<String> = std::iter::once(model_path.to_string())
            .chain(self.fallbacks.iter().filter(|p| *p != model_path).cloned())
            .collect();

        let mut last_error = String::new();
        for path in &candidates {
            let path = path.as_str();
            match self.loader.load(path) {
                Ok(backend) => {
                    tracing::info!(engine = %self.kind, path, "embedding engine ready");
                    self.backend = Some(backend);
                    self.loaded_from = Some(path.to_string());
                    return Ok(());
                }
                Err(reason) => {
                    tracing::warn!(engine = %self.kind, path, %reason, "model artifact failed to load");
                    last_error = reason;
                }
            }
        }

        Err(EngineError::ModelLoad {
            engine: self.kind,
            path: model_path.to_string(),
            reason: last_error,
        })
    }

    /// Run one forward pass and return the L2-normalized embedding.
    pub fn embed(&mut self, tensor: &Array4<f32>) -> Result<Embedding, EngineError> {
        let kind = self.kind;
        let backend = self
            .backend
            .as_mut()
            .ok_or(EngineError::ModelNotLoaded(kind))?;

        let expected = kind.preprocess_spec().shape();
        if tensor.shape() != expected.as_slice() {
            return Err(EngineError::Inference {
                engine: kind,
                reason: format!("expected input shape {expected:?}, got {:?}", tensor.shape()),
            });
        }

        let raw = backend
            .forward(tensor.view())
            .map_err(|reason| EngineError::Inference { engine: kind, reason })?;

        Embedding::normalized(raw).map_err(|e| EngineError::Inference {
            engine: kind,
            reason: e.to_string(),
        })
    }

    /// Drop the inference session. Idempotent.
    pub fn release(&mut self) {
        if self.backend.take().is_some() {
            tracing::info!(engine = %self.kind, "embedding engine released");
        }
        self.loaded_from = None;
    }
}
