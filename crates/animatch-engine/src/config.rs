use crate::analyzer::{AnalyzerOptions, DEFAULT_UPLOAD_MAX_DIM};
use crate::worker::WorkerSettings;
use animatch_core::face::{DEFAULT_DETECT_MAX_DIM, DEFAULT_FACE_PADDING};
use animatch_core::matching::{ParamsError, ScoringParams};
use animatch_core::variant::MATCHING_WEIGHTS_EXPERIMENT;
use std::path::{Path, PathBuf};
use thiserror::Error;

const GENERAL_MODEL: &str = "clip-image-encoder-q8.onnx";
const GENERAL_MODEL_LITE: &str = "clip-image-encoder-q4.onnx";
const GENERAL_MODEL_FULL: &str = "clip-image-encoder.onnx";
const FACE_MODEL: &str = "mobilefacenet-q8.onnx";
const DETECTOR_MODEL: &str = "det_10g.onnx";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Scoring { path: String, source: ParamsError },
}

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Character catalog (JSON, optionally gzip).
    pub catalog_path: PathBuf,
    /// JSON file holding sticky variant assignments.
    pub state_path: PathBuf,
    /// Experiment consulted for scoring overrides.
    pub experiment: String,
    /// Use the 4-bit CLIP encoder for low-memory hosts.
    pub lite_model: bool,
    pub detect_max_dim: u32,
    pub face_padding: f32,
    pub upload_max_dim: u32,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    pub concurrent_inference: bool,
    pub release_after_match: bool,
    /// Optional TOML overriding the scoring constants.
    pub scoring_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `ANIMATCH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("ANIMATCH_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                    PathBuf::from(home).join(".local/share")
                })
                .join("animatch")
        });

        let path_or = |key: &str, default: PathBuf| var(key).map(PathBuf::from).unwrap_or(default);
        let flag = |key: &str, default: bool| var(key).map(|v| v != "0").unwrap_or(default);

        Self {
            model_dir: path_or("ANIMATCH_MODEL_DIR", data_dir.join("models")),
            catalog_path: path_or("ANIMATCH_CATALOG", data_dir.join("embeddings.json")),
            state_path: path_or("ANIMATCH_STATE_PATH", data_dir.join("variants.json")),
            experiment: var("ANIMATCH_EXPERIMENT")
                .unwrap_or_else(|| MATCHING_WEIGHTS_EXPERIMENT.to_string()),
            lite_model: flag("ANIMATCH_LITE_MODEL", false),
            detect_max_dim: parse_or(&var, "ANIMATCH_DETECT_MAX_DIM", DEFAULT_DETECT_MAX_DIM),
            face_padding: parse_or(&var, "ANIMATCH_FACE_PADDING", DEFAULT_FACE_PADDING),
            upload_max_dim: parse_or(&var, "ANIMATCH_UPLOAD_MAX_DIM", DEFAULT_UPLOAD_MAX_DIM),
            intra_threads: parse_or(&var, "ANIMATCH_INTRA_THREADS", 1usize).max(1),
            concurrent_inference: flag("ANIMATCH_CONCURRENT_INFERENCE", false),
            release_after_match: flag("ANIMATCH_RELEASE_AFTER_MATCH", false),
            scoring_file: var("ANIMATCH_SCORING_FILE").map(PathBuf::from),
        }
    }

    fn model_path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }

    /// Primary CLIP encoder (8-bit, or 4-bit in lite mode).
    pub fn general_model_path(&self) -> String {
        self.model_path(if self.lite_model { GENERAL_MODEL_LITE } else { GENERAL_MODEL })
    }

    /// Full-precision CLIP encoder, tried when the quantized one fails.
    pub fn general_fallback_path(&self) -> String {
        self.model_path(GENERAL_MODEL_FULL)
    }

    pub fn face_model_path(&self) -> String {
        self.model_path(FACE_MODEL)
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_path(DETECTOR_MODEL)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            general_model: self.general_model_path(),
            general_fallbacks: vec![self.general_fallback_path()],
            face_model: self.face_model_path(),
        }
    }

    pub fn analyzer_options(&self) -> AnalyzerOptions {
        AnalyzerOptions {
            upload_max_dim: self.upload_max_dim,
            detect_max_dim: self.detect_max_dim,
            face_padding: self.face_padding,
            concurrent_inference: self.concurrent_inference,
            release_after_match: self.release_after_match,
        }
    }

    /// Scoring constants: the TOML file when configured, defaults otherwise.
    pub fn scoring_params(&self) -> Result<ScoringParams, ConfigError> {
        match &self.scoring_file {
            Some(path) => load_scoring_file(path),
            None => Ok(ScoringParams::default()),
        }
    }
}

fn load_scoring_file(path: &Path) -> Result<ScoringParams, ConfigError> {
    let path_str = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path_str.clone(),
        source,
    })?;
    let params = ScoringParams::from_toml_str(&text)
        .map_err(|source| ConfigError::Scoring { path: path_str.clone(), source })?;
    tracing::info!(path = %path_str, "scoring params loaded");
    Ok(params)
}

fn parse_or<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
