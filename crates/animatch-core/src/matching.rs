//! Dual-modality matching and spread-aware scoring.
//!
//! Every request is scored against the whole (orientation-filtered) catalog:
//!
//! 1. CLIP similarity for every candidate, plus ArcFace similarity where both
//!    the request and the candidate carry a face embedding.
//! 2. Fusion `α·clip + β·face` for dual-capable candidates, CLIP alone
//!    otherwise.
//! 3. A small tier weight, then a stable descending sort.
//! 4. Display percentages from the *spread* of fused similarities rather than
//!    min-max normalization, so a photo of a wall cannot read as a 90% match:
//!    a large spread means the models clearly preferred one character, a
//!    small spread means they could not tell the candidates apart.
//! 5. A confidence tier from the weighted-score gap between the top two.

use crate::catalog::CharacterCandidate;
use crate::result::{Confidence, MatchMode, MatchResult, ScoredCandidate};
use crate::types::{Embedding, Orientation};
use crate::variant::VariantConfig;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("no {0} candidates in the catalog")]
    EmptyPool(Orientation),
    #[error("embedding has {got} dims, catalog expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

#[derive(Error, Debug)]
pub enum ParamsError {
    #[error("parsing scoring params: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid scoring params: {0}")]
    Invalid(String),
}

/// Per-tier multipliers applied to the fused similarity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierWeights {
    #[serde(rename = "1")]
    pub tier1: f32,
    #[serde(rename = "2")]
    pub tier2: f32,
    #[serde(rename = "3")]
    pub tier3: f32,
}

impl Default for TierWeights {
    fn default() -> Self {
        Self { tier1: 1.02, tier2: 1.0, tier3: 0.98 }
    }
}

impl TierWeights {
    /// Weight for a tier; unknown tiers are neutral.
    pub fn weight(&self, tier: u8) -> f32 {
        match tier {
            1 => self.tier1,
            2 => self.tier2,
            3 => self.tier3,
            _ => 1.0,
        }
    }
}

/// Every tuned constant of the scoring pipeline.
///
/// Defaults reproduce the shipped behaviour exactly; a TOML file can
/// override any subset of them. When a request carries a [`VariantConfig`],
/// its fusion weights, dual spread threshold and tier weights win over
/// `general_weight`, `face_weight`, `dual_spread_threshold` and
/// `tier_weights` here; see [`ScoringParams::shadowed_by`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringParams {
    /// CLIP weight α in dual fusion.
    pub general_weight: f32,
    /// ArcFace weight β in dual fusion.
    pub face_weight: f32,
    pub tier_weights: TierWeights,
    /// Spread at which CLIP-only rankings count as fully separated.
    pub single_spread_threshold: f32,
    /// Spread at which dual rankings count as fully separated.
    pub dual_spread_threshold: f32,
    /// Below this spread every candidate sits at relative position 0.5.
    pub min_spread: f32,
    pub base_weight: f32,
    pub spread_weight: f32,
    pub face_bonus: f32,
    pub percent_floor: f32,
    pub percent_ceiling: f32,
    pub percent_scale: f32,
    pub high_gap: f32,
    pub medium_gap: f32,
    pub top_n: usize,
    pub random_percent_min: u8,
    pub random_percent_max: u8,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            general_weight: 0.3,
            face_weight: 0.7,
            tier_weights: TierWeights::default(),
            single_spread_threshold: 0.05,
            dual_spread_threshold: 0.15,
            min_spread: 0.0001,
            base_weight: 0.35,
            spread_weight: 0.40,
            face_bonus: 0.12,
            percent_floor: 50.0,
            percent_ceiling: 97.0,
            percent_scale: 47.0,
            high_gap: 0.02,
            medium_gap: 0.008,
            top_n: 3,
            random_percent_min: 55,
            random_percent_max: 80,
        }
    }
}

impl ScoringParams {
    pub fn from_toml_str(src: &str) -> Result<Self, ParamsError> {
        let params: Self = toml::from_str(src)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        let invalid = |msg: &str| Err(ParamsError::Invalid(msg.to_string()));
        if !(self.single_spread_threshold > 0.0 && self.dual_spread_threshold > 0.0) {
            return invalid("spread thresholds must be positive");
        }
        let in_u8 = |v: f32| v.is_finite() && (0.0..=f32::from(u8::MAX)).contains(&v);
        if !(in_u8(self.percent_floor) && in_u8(self.percent_ceiling)) {
            return invalid("percent_floor and percent_ceiling must lie in 0..=255");
        }
        if self.percent_floor > self.percent_ceiling {
            return invalid("percent_floor exceeds percent_ceiling");
        }
        if self.random_percent_min > self.random_percent_max {
            return invalid("random_percent_min exceeds random_percent_max");
        }
        if self.top_n == 0 {
            return invalid("top_n must be at least 1");
        }
        if self.medium_gap > self.high_gap {
            return invalid("medium_gap exceeds high_gap");
        }
        Ok(())
    }

    /// Fields set away from their defaults that `variant` overrides.
    pub fn shadowed_by(&self, variant: &VariantConfig) -> Vec<&'static str> {
        let defaults = Self::default();
        let mut shadowed = Vec::new();
        if self.general_weight != defaults.general_weight && self.general_weight != variant.general_weight {
            shadowed.push("general_weight");
        }
        if self.face_weight != defaults.face_weight && self.face_weight != variant.face_weight {
            shadowed.push("face_weight");
        }
        if self.dual_spread_threshold != defaults.dual_spread_threshold
            && self.dual_spread_threshold != variant.spread_threshold
        {
            shadowed.push("dual_spread_threshold");
        }
        if self.tier_weights != defaults.tier_weights && self.tier_weights != variant.tier_weights {
            shadowed.push("tier_weights");
        }
        shadowed
    }

    /// Spread-aware display percentage for one candidate.
    ///
    /// `best`/`worst` are the global max/min fused similarities of the
    /// request. Always returns an integer in `[percent_floor, percent_ceiling]`.
    pub fn similarity_to_percent(
        &self,
        similarity: f32,
        best: f32,
        worst: f32,
        spread_threshold: f32,
        has_face: bool,
    ) -> u8 {
        let spread = best - worst;
        let rel_pos = if spread > self.min_spread {
            (similarity - worst) / spread
        } else {
            0.5
        };
        let spread_quality = (spread / spread_threshold).clamp(0.0, 1.0);
        let bonus = if has_face { self.face_bonus } else { 0.0 };
        let score = rel_pos * (self.base_weight + self.spread_weight * spread_quality) + bonus;

        let percent = self.percent_floor + score * self.percent_scale;
        if !percent.is_finite() {
            return self.percent_floor.round() as u8;
        }
        percent.clamp(self.percent_floor, self.percent_ceiling).round() as u8
    }

    /// Confidence tier from the weighted-score gap between first and second.
    pub fn confidence_for_gap(&self, gap: f32) -> Confidence {
        if gap > self.high_gap {
            Confidence::High
        } else if gap > self.medium_gap {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

/// The request side of a match.
#[derive(Debug, Clone, Copy)]
pub struct MatchQuery<'a> {
    pub general: &'a Embedding,
    pub face: Option<&'a Embedding>,
    pub orientation: Orientation,
    /// Whether a face was detected (and cropped) in the photo.
    pub has_face: bool,
}

/// Full ranking of one request, best first.
#[derive(Debug, Clone)]
pub struct Ranking {
    pub candidates: Vec<ScoredCandidate>,
    pub confidence: Confidence,
    pub mode: MatchMode,
    pub spread: f32,
    pub spread_threshold: f32,
}

/// Scores requests against a candidate pool.
#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    params: ScoringParams,
}

impl ScoringEngine {
    pub fn new(params: ScoringParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ScoringParams {
        &self.params
    }

    /// Rank every candidate of the requested orientation.
    pub fn rank(
        &self,
        query: &MatchQuery<'_>,
        pool: &[Arc<CharacterCandidate>],
        variant: Option<&VariantConfig>,
    ) -> Result<Ranking, MatchError> {
        let p = &self.params;
        let (alpha, beta, dual_threshold, tiers) = match variant {
            Some(v) => (v.general_weight, v.face_weight, v.spread_threshold, v.tier_weights),
            None => (p.general_weight, p.face_weight, p.dual_spread_threshold, p.tier_weights),
        };

        let mut scored = Vec::new();
        let mut face_dim_mismatches = 0usize;
        for candidate in pool.iter().filter(|c| c.orientation == query.orientation) {
            let general_similarity = query.general.similarity(&candidate.embedding).ok_or(
                MatchError::DimensionMismatch {
                    expected: candidate.embedding.len(),
                    got: query.general.dim(),
                },
            )?;

            let face_similarity = match (query.face, candidate.face_embedding.as_deref()) {
                (Some(face), Some(reference)) => {
                    let sim = face.similarity(reference);
                    if sim.is_none() {
                        face_dim_mismatches += 1;
                    }
                    sim
                }
                _ => None,
            };

            let similarity = match face_similarity {
                Some(face_sim) => alpha * general_similarity + beta * face_sim,
                None => general_similarity,
            };

            scored.push(ScoredCandidate {
                candidate: Arc::clone(candidate),
                general_similarity,
                face_similarity,
                similarity,
                weighted_score: similarity * tiers.weight(candidate.tier),
                percent: 0,
                rank: 0,
            });
        }

        if scored.is_empty() {
            return Err(MatchError::EmptyPool(query.orientation));
        }
        if face_dim_mismatches > 0 {
            tracing::warn!(
                count = face_dim_mismatches,
                "face embedding dimension differs from catalog; scored those candidates on CLIP only"
            );
        }

        // Stable: equal weighted scores keep catalog order.
        scored.sort_by(|a, b| {
            b.weighted_score
                .partial_cmp(&a.weighted_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let dual = scored.iter().any(ScoredCandidate::is_dual);
        let spread_threshold = if dual { dual_threshold } else { p.single_spread_threshold };

        let (best, worst) = scored.iter().fold((f32::NEG_INFINITY, f32::INFINITY), |(hi, lo), s| {
            (hi.max(s.similarity), lo.min(s.similarity))
        });

        for (rank, s) in scored.iter_mut().enumerate() {
            s.rank = rank;
            s.percent = p.similarity_to_percent(s.similarity, best, worst, spread_threshold, query.has_face);
        }

        let gap = match scored.as_slice() {
            [first, second, ..] => first.weighted_score - second.weighted_score,
            _ => 1.0,
        };
        let confidence = p.confidence_for_gap(gap);
        let mode = if dual { MatchMode::Dual } else { MatchMode::General };

        tracing::debug!(
            candidates = scored.len(),
            %mode,
            spread = best - worst,
            spread_threshold,
            gap,
            %confidence,
            "ranked candidates"
        );

        Ok(Ranking {
            candidates: scored,
            confidence,
            mode,
            spread: best - worst,
            spread_threshold,
        })
    }

    /// Rank and keep the top N as a [`MatchResult`].
    pub fn find_best(
        &self,
        query: &MatchQuery<'_>,
        pool: &[Arc<CharacterCandidate>],
        variant: Option<&VariantConfig>,
    ) -> Result<MatchResult, MatchError> {
        let ranking = self.rank(query, pool, variant)?;
        MatchResult::assemble(ranking.candidates, ranking.confidence, self.params.top_n, ranking.mode)
            .ok_or(MatchError::EmptyPool(query.orientation))
    }

    /// Fallback when no embedding engine is usable: a uniformly random
    /// candidate with a plausible percentage and low confidence.
    pub fn random_match<R: Rng + ?Sized>(
        &self,
        orientation: Orientation,
        pool: &[Arc<CharacterCandidate>],
        rng: &mut R,
    ) -> Result<MatchResult, MatchError> {
        let candidates: Vec<&Arc<CharacterCandidate>> =
            pool.iter().filter(|c| c.orientation == orientation).collect();
        let picked = candidates
            .choose(rng)
            .ok_or(MatchError::EmptyPool(orientation))?;
        let percent = rng.gen_range(self.params.random_percent_min..=self.params.random_percent_max);

        tracing::info!(character = picked.id, percent, "random fallback match");

        let scored = ScoredCandidate {
            candidate: Arc::clone(picked),
            general_similarity: 0.0,
            face_similarity: None,
            similarity: 0.0,
            weighted_score: 0.0,
            percent,
            rank: 0,
        };
        MatchResult::assemble(vec![scored], Confidence::Low, 1, MatchMode::Random)
            .ok_or(MatchError::EmptyPool(orientation))
    }
}
