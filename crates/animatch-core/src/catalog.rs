//! Character catalog: the static embedding blob shipped next to the models.
//!
//! The blob is JSON (`{ model, embedding_dim, count, characters }`), either
//! plain or gzip-compressed. Loading is all-or-nothing: any parse or
//! validation failure rejects the whole catalog.

use crate::types::Orientation;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const TIER_RANGE: std::ops::RangeInclusive<u8> = 1..=3;
const NORM_TOLERANCE: f32 = 1e-3;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog file not found: {0}")]
    NotFound(String),
    #[error("reading catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing catalog JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("character {id}: {reason}")]
    InvalidCharacter { id: u32, reason: String },
}

/// One immutable catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterCandidate {
    #[serde(rename = "heroine_id")]
    pub id: u32,
    #[serde(rename = "heroine_name")]
    pub name: String,
    #[serde(rename = "heroine_name_en", default)]
    pub name_en: Option<String>,
    #[serde(rename = "heroine_name_ja", default)]
    pub name_ja: Option<String>,
    #[serde(rename = "heroine_name_zh_tw", default)]
    pub name_zh_tw: Option<String>,
    #[serde(default)]
    pub anime: String,
    pub orientation: Orientation,
    pub tier: u8,
    /// General (CLIP) embedding, unit-normalized.
    pub embedding: Vec<f32>,
    /// Face (ArcFace) embedding; some characters have none.
    #[serde(rename = "arcface_embedding", default)]
    pub face_embedding: Option<Vec<f32>>,
}

impl CharacterCandidate {
    /// Display name for a locale tag (`en`, `ja`, `zh-TW`), falling back to
    /// the primary name.
    pub fn display_name(&self, locale: &str) -> &str {
        let localized = match locale {
            "en" => self.name_en.as_deref(),
            "ja" => self.name_ja.as_deref(),
            "zh-TW" | "zh_tw" => self.name_zh_tw.as_deref(),
            _ => None,
        };
        localized.filter(|s| !s.is_empty()).unwrap_or(&self.name)
    }

    pub fn has_face_embedding(&self) -> bool {
        self.face_embedding.is_some()
    }
}

#[derive(Deserialize)]
struct RawCatalog {
    model: String,
    embedding_dim: usize,
    #[serde(default)]
    count: Option<usize>,
    characters: Vec<CharacterCandidate>,
}

/// The loaded, validated catalog. Shared read-only for the process lifetime.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub model: String,
    pub embedding_dim: usize,
    /// Dimension of the face embeddings, if any character carries one.
    pub face_embedding_dim: Option<usize>,
    characters: Vec<Arc<CharacterCandidate>>,
}

impl Catalog {
    /// Load a catalog file, plain or gzip.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        if !path.exists() {
            return Err(CatalogError::NotFound(path.display().to_string()));
        }
        let bytes = std::fs::read(path)?;
        let catalog = Self::from_bytes(&bytes)?;
        tracing::info!(
            path = %path.display(),
            model = %catalog.model,
            characters = catalog.len(),
            dim = catalog.embedding_dim,
            face_dim = ?catalog.face_embedding_dim,
            "catalog loaded"
        );
        Ok(catalog)
    }

    /// Parse catalog bytes, transparently inflating gzip input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CatalogError> {
        let json = if bytes.starts_with(&GZIP_MAGIC) {
            let mut text = String::new();
            GzDecoder::new(bytes).read_to_string(&mut text)?;
            text
        } else {
            String::from_utf8(bytes.to_vec()).map_err(|e| {
                CatalogError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })?
        };

        let raw: RawCatalog = serde_json::from_str(&json)?;
        Self::validate(raw)
    }

    fn validate(raw: RawCatalog) -> Result<Self, CatalogError> {
        if let Some(count) = raw.count {
            if count != raw.characters.len() {
                tracing::warn!(
                    declared = count,
                    actual = raw.characters.len(),
                    "catalog count does not match character list"
                );
            }
        }

        let mut face_dim: Option<usize> = None;
        for c in &raw.characters {
            let invalid = |reason: String| CatalogError::InvalidCharacter { id: c.id, reason };

            if !TIER_RANGE.contains(&c.tier) {
                return Err(invalid(format!("tier {} outside 1..=3", c.tier)));
            }
            if c.embedding.len() != raw.embedding_dim {
                return Err(invalid(format!(
                    "embedding has {} dims, catalog declares {}",
                    c.embedding.len(),
                    raw.embedding_dim
                )));
            }
            check_vector(&c.embedding).map_err(|r| invalid(format!("embedding {r}")))?;

            if let Some(face) = &c.face_embedding {
                match face_dim {
                    None => face_dim = Some(face.len()),
                    Some(d) if d != face.len() => {
                        return Err(invalid(format!(
                            "face embedding has {} dims, expected {d}",
                            face.len()
                        )));
                    }
                    Some(_) => {}
                }
                check_vector(face).map_err(|r| invalid(format!("face embedding {r}")))?;
            }
        }

        Ok(Self {
            model: raw.model,
            embedding_dim: raw.embedding_dim,
            face_embedding_dim: face_dim,
            characters: raw.characters.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn characters(&self) -> &[Arc<CharacterCandidate>] {
        &self.characters
    }

    pub fn len(&self) -> usize {
        self.characters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&Arc<CharacterCandidate>> {
        self.characters.iter().find(|c| c.id == id)
    }

    /// Number of characters per orientation.
    pub fn count_by_orientation(&self, orientation: Orientation) -> usize {
        self.characters
            .iter()
            .filter(|c| c.orientation == orientation)
            .count()
    }
}

fn check_vector(values: &[f32]) -> Result<(), String> {
    if values.is_empty() {
        return Err("is empty".into());
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err("contains non-finite values".into());
    }
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return Err("has zero norm".into());
    }
    if (norm - 1.0).abs() > NORM_TOLERANCE {
        tracing::warn!(norm, "catalog vector is not unit-normalized");
    }
    Ok(())
}
