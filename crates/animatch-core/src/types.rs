use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Orientation tag used to pre-filter the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Male,
    Female,
}

impl Orientation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Male => "male",
            Orientation::Female => "female",
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("unknown orientation {0:?} (expected \"male\" or \"female\")")]
pub struct ParseOrientationError(String);

impl FromStr for Orientation {
    type Err = ParseOrientationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "male" => Ok(Orientation::Male),
            "female" => Ok(Orientation::Female),
            _ => Err(ParseOrientationError(s.to_string())),
        }
    }
}

/// Bounding box for a detected face, in source-image pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl DetectedFace {
    /// Rescale every box field by the given per-axis factors.
    pub fn scaled(&self, scale_x: f32, scale_y: f32) -> Self {
        Self {
            x: self.x * scale_x,
            y: self.y * scale_y,
            width: self.width * scale_x,
            height: self.height * scale_y,
            confidence: self.confidence,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding is empty")]
    Empty,
    #[error("embedding contains non-finite values")]
    NonFinite,
    #[error("embedding has zero norm")]
    ZeroNorm,
}

/// Unit-normalized embedding vector.
///
/// The only way to build one is through [`Embedding::normalized`], so every
/// value of this type has Euclidean norm 1 (within float tolerance).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// L2-normalize a raw model output.
    pub fn normalized(raw: Vec<f32>) -> Result<Self, EmbeddingError> {
        if raw.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        if raw.iter().any(|x| !x.is_finite()) {
            return Err(EmbeddingError::NonFinite);
        }

        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            return Err(EmbeddingError::ZeroNorm);
        }

        Ok(Self {
            values: raw.into_iter().map(|x| x / norm).collect(),
        })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Cosine similarity against a unit vector of the same dimension.
    ///
    /// Returns `None` when the dimensions differ: vectors from different
    /// embedding spaces are not comparable.
    pub fn similarity(&self, other: &[f32]) -> Option<f32> {
        if self.values.len() != other.len() {
            return None;
        }
        Some(cosine_similarity(&self.values, other))
    }
}

/// Cosine similarity of two unit vectors, i.e. their dot product.
///
/// Clamped to [-1, 1] to absorb float drift on nearly-parallel vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot.clamp(-1.0, 1.0)
}
