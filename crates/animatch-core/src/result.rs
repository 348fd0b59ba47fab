use crate::catalog::CharacterCandidate;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// How decisively the top pick beat the runner-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        })
    }
}

/// Which signal produced the ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// CLIP and ArcFace similarities fused.
    Dual,
    /// CLIP similarity only.
    General,
    /// No embeddings available; uniform random pick.
    Random,
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchMode::Dual => "dual",
            MatchMode::General => "general",
            MatchMode::Random => "random",
        })
    }
}

/// One catalog entry scored against the request.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: Arc<CharacterCandidate>,
    /// CLIP cosine similarity.
    pub general_similarity: f32,
    /// ArcFace cosine similarity, when both sides had a face embedding.
    pub face_similarity: Option<f32>,
    /// Fused similarity before tier weighting.
    pub similarity: f32,
    /// `similarity × tier weight`; the ranking key.
    pub weighted_score: f32,
    /// Display percentage in [50, 97] (random matches use their own band).
    pub percent: u8,
    /// 0-based position in the ranking.
    pub rank: usize,
}

impl ScoredCandidate {
    pub fn is_dual(&self) -> bool {
        self.face_similarity.is_some()
    }
}

/// Terminal, immutable output of one analysis.
#[derive(Debug, Clone)]
pub struct MatchResult {
    top_n: Vec<ScoredCandidate>,
    pub confidence: Confidence,
    pub mode: MatchMode,
}

impl MatchResult {
    /// Package a ranking (best first) into a result keeping the first `top_n`.
    ///
    /// Returns `None` for an empty ranking.
    pub fn assemble(
        mut ranked: Vec<ScoredCandidate>,
        confidence: Confidence,
        top_n: usize,
        mode: MatchMode,
    ) -> Option<Self> {
        if ranked.is_empty() {
            return None;
        }
        ranked.truncate(top_n.max(1));
        Some(Self { top_n: ranked, confidence, mode })
    }

    /// The primary match.
    pub fn best(&self) -> &ScoredCandidate {
        &self.top_n[0]
    }

    pub fn character(&self) -> &Arc<CharacterCandidate> {
        &self.best().candidate
    }

    /// Raw fused similarity of the primary match.
    pub fn score(&self) -> f32 {
        self.best().similarity
    }

    pub fn percent(&self) -> u8 {
        self.best().percent
    }

    /// Primary match plus runners-up, best first.
    pub fn top_n(&self) -> &[ScoredCandidate] {
        &self.top_n
    }

    /// Flat record for analytics collaborators.
    pub fn summary(&self, variant: Option<&str>, faces_detected: usize) -> AnalysisSummary {
        AnalysisSummary {
            character_id: self.character().id,
            character_name: self.character().name.clone(),
            score: self.score(),
            percent: self.percent(),
            confidence: self.confidence,
            mode: self.mode,
            variant: variant.map(str::to_string),
            faces_detected,
            runners_up: self.top_n[1..].iter().map(|s| s.candidate.id).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSummary {
    pub character_id: u32,
    pub character_name: String,
    pub score: f32,
    pub percent: u8,
    pub confidence: Confidence,
    pub mode: MatchMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    pub faces_detected: usize,
    pub runners_up: Vec<u32>,
}
