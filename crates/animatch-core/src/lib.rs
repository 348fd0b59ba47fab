//! animatch-core: anime character look-alike matching.
//!
//! Embeds a photo with a CLIP image encoder and, when a face is found, an
//! ArcFace face encoder (both via ONNX Runtime), then scores the embeddings
//! against a static catalog of character embeddings.

pub mod catalog;
pub mod detector;
pub mod embedder;
pub mod face;
pub mod guidelines;
pub mod matching;
pub mod preprocess;
pub mod result;
pub mod types;
pub mod variant;

pub use catalog::{Catalog, CharacterCandidate};
pub use embedder::{EmbeddingEngine, EngineKind, ModelLoader, OrtLoader};
pub use matching::{MatchQuery, ScoringEngine, ScoringParams};
pub use result::{AnalysisSummary, Confidence, MatchMode, MatchResult, ScoredCandidate};
pub use types::{DetectedFace, Embedding, Orientation};
pub use variant::VariantConfig;
