//! animatch-engine: isolated inference and analysis orchestration.
//!
//! Runs both embedding engines on a dedicated worker thread and drives a
//! photo through detection, embedding and scoring.

pub mod analyzer;
pub mod config;
pub mod state;
pub mod worker;

pub use analyzer::{
    Analysis, AnalysisError, AnalysisOutcome, AnalysisRequest, Analyzer, AnalyzerOptions, CancelHandle,
    FaceSelection, ImageInput,
};
pub use config::Config;
pub use state::{EngineStates, EngineStatus};
pub use worker::{spawn_worker, WorkerError, WorkerHandle, WorkerRequest, WorkerResponse, WorkerSettings};
