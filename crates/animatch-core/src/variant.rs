//! Matching-weight experiments with sticky per-user variant assignment.
//!
//! Experiments are compiled-in constants. A user is assigned a variant by a
//! weighted draw the first time an experiment is consulted; the assignment is
//! persisted through a [`VariantStore`] so later sessions see the same one.

use crate::matching::TierWeights;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name returned whenever no experiment applies.
pub const CONTROL_VARIANT: &str = "control";

/// Id of the built-in matching-weights experiment.
pub const MATCHING_WEIGHTS_EXPERIMENT: &str = "matching-weights-v2";

const WEIGHT_SUM_TOLERANCE: f32 = 1e-6;

/// Scoring overrides for one experiment arm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VariantConfig {
    pub general_weight: f32,
    pub face_weight: f32,
    /// Spread-quality threshold used in dual mode.
    pub spread_threshold: f32,
    pub tier_weights: TierWeights,
}

impl VariantConfig {
    pub const fn new(general_weight: f32, face_weight: f32, spread_threshold: f32) -> Self {
        Self {
            general_weight,
            face_weight,
            spread_threshold,
            tier_weights: TierWeights { tier1: 1.02, tier2: 1.0, tier3: 0.98 },
        }
    }

    fn validate(&self) -> Result<(), String> {
        for (label, w) in [("general_weight", self.general_weight), ("face_weight", self.face_weight)] {
            if !(0.0..=1.0).contains(&w) {
                return Err(format!("{label} {w} outside [0, 1]"));
            }
        }
        if !(self.spread_threshold > 0.0) {
            return Err(format!("spread_threshold {} must be positive", self.spread_threshold));
        }
        Ok(())
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ExperimentError {
    #[error("experiment {0} has no variants")]
    NoVariants(String),
    #[error("experiment {id}: {variants} variants but {weights} traffic weights")]
    WeightCount { id: String, variants: usize, weights: usize },
    #[error("experiment {id}: traffic weight {weight} is negative")]
    NegativeWeight { id: String, weight: f32 },
    #[error("experiment {id}: traffic weights sum to {sum}, above 1")]
    WeightSum { id: String, sum: f32 },
    #[error("experiment {id}, variant {variant}: {reason}")]
    InvalidVariant { id: String, variant: String, reason: String },
}

/// A named set of variants with a traffic split.
#[derive(Debug, Clone)]
pub struct Experiment {
    id: String,
    active: bool,
    /// Declaration order matters: the split and the draw fallback follow it.
    variants: Vec<(String, VariantConfig)>,
    weights: Vec<f32>,
}

impl Experiment {
    pub fn new(
        id: impl Into<String>,
        active: bool,
        variants: Vec<(String, VariantConfig)>,
        weights: Vec<f32>,
    ) -> Result<Self, ExperimentError> {
        let id = id.into();
        if variants.is_empty() {
            return Err(ExperimentError::NoVariants(id));
        }
        if variants.len() != weights.len() {
            return Err(ExperimentError::WeightCount {
                id,
                variants: variants.len(),
                weights: weights.len(),
            });
        }
        if let Some(&weight) = weights.iter().find(|w| !(**w >= 0.0)) {
            return Err(ExperimentError::NegativeWeight { id, weight });
        }
        let sum: f32 = weights.iter().sum();
        if sum > 1.0 + WEIGHT_SUM_TOLERANCE {
            return Err(ExperimentError::WeightSum { id, sum });
        }
        for (name, config) in &variants {
            config.validate().map_err(|reason| ExperimentError::InvalidVariant {
                id: id.clone(),
                variant: name.clone(),
                reason,
            })?;
        }

        Ok(Self { id, active, variants, weights })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn variant(&self, name: &str) -> Option<&VariantConfig> {
        self.variants.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub fn variant_names(&self) -> impl Iterator<Item = &str> {
        self.variants.iter().map(|(n, _)| n.as_str())
    }

    /// Weighted pick for a uniform draw in [0, 1). A draw past the
    /// cumulative sum lands on the first variant.
    fn pick(&self, draw: f32) -> &str {
        let mut cumulative = 0.0f32;
        for ((name, _), weight) in self.variants.iter().zip(&self.weights) {
            cumulative += weight;
            if draw < cumulative {
                return name;
            }
        }
        &self.variants[0].0
    }
}

/// All known experiments.
#[derive(Debug, Clone)]
pub struct ExperimentRegistry {
    experiments: Vec<Experiment>,
}

impl Default for ExperimentRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ExperimentRegistry {
    pub fn new(experiments: Vec<Experiment>) -> Self {
        Self { experiments }
    }

    /// The compiled-in experiment set.
    pub fn builtin() -> Self {
        let variants = vec![
            (CONTROL_VARIANT.to_string(), VariantConfig::new(0.3, 0.7, 0.15)),
            ("variant_a_arcface_heavier".to_string(), VariantConfig::new(0.1, 0.9, 0.15)),
            ("variant_b_clip_heavier".to_string(), VariantConfig::new(0.7, 0.3, 0.15)),
        ];
        let experiments = Experiment::new(MATCHING_WEIGHTS_EXPERIMENT, true, variants, vec![0.34, 0.33, 0.33])
            .map(|e| vec![e])
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "built-in experiment rejected");
                Vec::new()
            });
        Self { experiments }
    }

    pub fn get(&self, id: &str) -> Option<&Experiment> {
        self.experiments.iter().find(|e| e.id == id)
    }

    /// The first active experiment.
    pub fn active(&self) -> Option<&Experiment> {
        self.experiments.iter().find(|e| e.active)
    }

    pub fn experiments(&self) -> &[Experiment] {
        &self.experiments
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("variant store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("variant store format: {0}")]
    Format(#[from] serde_json::Error),
}

/// Persistent key/value storage for variant assignments.
pub trait VariantStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Storage key for an experiment's assignment.
pub fn storage_key(experiment_id: &str) -> String {
    format!("ab_variant_{experiment_id}")
}

/// In-process store; assignments last as long as the value.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: HashMap<String, String>,
}

impl VariantStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// A flat JSON object on disk. A missing file reads as empty.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<HashMap<String, String>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl VariantStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.read_all()?;
        entries.insert(key.to_string(), value.to_string());
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(&entries)?)?;
        Ok(())
    }
}

/// Variant for `experiment_id`, assigning and persisting one on first use.
///
/// Unknown or inactive experiments yield [`CONTROL_VARIANT`]. Store failures
/// are logged and otherwise ignored: the draw still stands for this call.
pub fn assign_variant<R: Rng + ?Sized>(
    registry: &ExperimentRegistry,
    experiment_id: &str,
    store: &mut dyn VariantStore,
    rng: &mut R,
) -> String {
    let Some(experiment) = registry.get(experiment_id).filter(|e| e.active) else {
        return CONTROL_VARIANT.to_string();
    };
    let key = storage_key(experiment_id);

    match store.get(&key) {
        Ok(Some(stored)) if experiment.variant(&stored).is_some() => return stored,
        Ok(Some(stale)) => {
            tracing::debug!(experiment = experiment_id, stale = %stale, "stored variant no longer exists; reassigning")
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(experiment = experiment_id, error = %e, "variant store read failed"),
    }

    let assigned = experiment.pick(rng.gen::<f32>()).to_string();
    if let Err(e) = store.set(&key, &assigned) {
        tracing::warn!(experiment = experiment_id, error = %e, "variant store write failed");
    }
    tracing::info!(experiment = experiment_id, variant = %assigned, "assigned experiment variant");
    assigned
}

/// Scoring overrides for the user's variant; `None` means engine defaults.
pub fn variant_config<R: Rng + ?Sized>(
    registry: &ExperimentRegistry,
    experiment_id: &str,
    store: &mut dyn VariantStore,
    rng: &mut R,
) -> Option<VariantConfig> {
    let experiment = registry.get(experiment_id).filter(|e| e.active)?;
    let name = assign_variant(registry, experiment_id, store, rng);
    experiment.variant(&name).copied()
}

pub fn active_experiment_id(registry: &ExperimentRegistry) -> Option<&str> {
    registry.active().map(Experiment::id)
}

/// `"<experiment>:<variant>"` for the active experiment, for analytics.
pub fn active_variant_label<R: Rng + ?Sized>(
    registry: &ExperimentRegistry,
    store: &mut dyn VariantStore,
    rng: &mut R,
) -> Option<String> {
    let id = active_experiment_id(registry)?;
    let variant = assign_variant(registry, id, store, rng);
    Some(format!("{id}:{variant}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct BrokenStore;

    impl VariantStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(std::io::Error::other("read denied").into())
        }

        fn set(&mut self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(std::io::Error::other("write denied").into())
        }
    }

    fn named(name: &str, config: VariantConfig) -> (String, VariantConfig) {
        (name.to_string(), config)
    }

    #[test]
    fn test_builtin_experiment() {
        let registry = ExperimentRegistry::builtin();
        let exp = registry.get(MATCHING_WEIGHTS_EXPERIMENT).unwrap();
        assert!(exp.is_active());
        assert_eq!(
            exp.variant_names().collect::<Vec<_>>(),
            vec!["control", "variant_a_arcface_heavier", "variant_b_clip_heavier"]
        );
        assert_eq!(exp.variant("control"), Some(&VariantConfig::new(0.3, 0.7, 0.15)));
        assert_eq!(exp.variant("variant_a_arcface_heavier").unwrap().face_weight, 0.9);
        assert_eq!(exp.variant("variant_b_clip_heavier").unwrap().general_weight, 0.7);
        assert_eq!(active_experiment_id(&registry), Some(MATCHING_WEIGHTS_EXPERIMENT));
    }

    #[test]
    fn test_unknown_experiment_is_control() {
        let registry = ExperimentRegistry::builtin();
        let mut store = MemoryStore::default();
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(assign_variant(&registry, "nope", &mut store, &mut rng), CONTROL_VARIANT);
        assert!(variant_config(&registry, "nope", &mut store, &mut rng).is_none());
        assert!(store.entries.is_empty());
    }

    #[test]
    fn test_inactive_experiment_is_control() {
        let exp = Experiment::new(
            "paused",
            false,
            vec![named("control", VariantConfig::new(0.3, 0.7, 0.15)), named("b", VariantConfig::new(1.0, 0.0, 0.1))],
            vec![0.0, 1.0],
        )
        .unwrap();
        let registry = ExperimentRegistry::new(vec![exp]);
        let mut store = MemoryStore::default();
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(assign_variant(&registry, "paused", &mut store, &mut rng), "control");
        assert!(variant_config(&registry, "paused", &mut store, &mut rng).is_none());
        assert!(active_variant_label(&registry, &mut store, &mut rng).is_none());
    }

    #[test]
    fn test_assignment_is_sticky() {
        let registry = ExperimentRegistry::builtin();
        let mut store = MemoryStore::default();
        let mut rng = StdRng::seed_from_u64(99);
        let first = assign_variant(&registry, MATCHING_WEIGHTS_EXPERIMENT, &mut store, &mut rng);
        for _ in 0..20 {
            assert_eq!(assign_variant(&registry, MATCHING_WEIGHTS_EXPERIMENT, &mut store, &mut rng), first);
        }
        assert_eq!(
            store.get("ab_variant_matching-weights-v2").unwrap().as_deref(),
            Some(first.as_str())
        );
    }

    #[test]
    fn test_stored_value_wins() {
        let registry = ExperimentRegistry::builtin();
        let mut store = MemoryStore::default();
        store.set("ab_variant_matching-weights-v2", "variant_b_clip_heavier").unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let config = variant_config(&registry, MATCHING_WEIGHTS_EXPERIMENT, &mut store, &mut rng).unwrap();
        assert_eq!(config.general_weight, 0.7);
        assert_eq!(
            active_variant_label(&registry, &mut store, &mut rng).as_deref(),
            Some("matching-weights-v2:variant_b_clip_heavier")
        );
    }

    #[test]
    fn test_stale_stored_value_reassigned() {
        let registry = ExperimentRegistry::builtin();
        let mut store = MemoryStore::default();
        store.set("ab_variant_matching-weights-v2", "treatment_gone").unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let v = assign_variant(&registry, MATCHING_WEIGHTS_EXPERIMENT, &mut store, &mut rng);
        assert!(registry.get(MATCHING_WEIGHTS_EXPERIMENT).unwrap().variant(&v).is_some());
        assert_eq!(store.get("ab_variant_matching-weights-v2").unwrap(), Some(v));
    }

    #[test]
    fn test_split_roughly_matches_weights() {
        let registry = ExperimentRegistry::builtin();
        let mut rng = StdRng::seed_from_u64(2024);
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..3000 {
            let mut store = MemoryStore::default();
            let v = assign_variant(&registry, MATCHING_WEIGHTS_EXPERIMENT, &mut store, &mut rng);
            *counts.entry(v).or_default() += 1;
        }
        for (name, share) in [
            ("control", 0.34),
            ("variant_a_arcface_heavier", 0.33),
            ("variant_b_clip_heavier", 0.33),
        ] {
            let observed = counts[name] as f32 / 3000.0;
            assert!((observed - share).abs() < 0.05, "{name}: {observed}");
        }
    }

    #[test]
    fn test_draw_past_cumulative_sum_is_first_variant() {
        let exp = Experiment::new(
            "partial",
            true,
            vec![named("first", VariantConfig::new(0.3, 0.7, 0.15)), named("second", VariantConfig::new(0.5, 0.5, 0.15))],
            vec![0.2, 0.3],
        )
        .unwrap();
        assert_eq!(exp.pick(0.1), "first");
        assert_eq!(exp.pick(0.4), "second");
        assert_eq!(exp.pick(0.9), "first");
    }

    #[test]
    fn test_store_failures_are_ignored() {
        let registry = ExperimentRegistry::builtin();
        let mut rng = StdRng::seed_from_u64(8);
        let v = assign_variant(&registry, MATCHING_WEIGHTS_EXPERIMENT, &mut BrokenStore, &mut rng);
        assert!(registry.get(MATCHING_WEIGHTS_EXPERIMENT).unwrap().variant(&v).is_some());
    }

    #[test]
    fn test_validation() {
        let ok = VariantConfig::new(0.3, 0.7, 0.15);
        let err = Experiment::new("e", true, vec![named("a", ok)], vec![0.5, 0.5]).unwrap_err();
        assert!(matches!(err, ExperimentError::WeightCount { variants: 1, weights: 2, .. }));

        let err = Experiment::new("e", true, vec![named("a", ok), named("b", ok)], vec![-0.1, 0.5]).unwrap_err();
        assert!(matches!(err, ExperimentError::NegativeWeight { .. }));

        let err = Experiment::new("e", true, vec![named("a", ok), named("b", ok)], vec![0.7, 0.7]).unwrap_err();
        assert!(matches!(err, ExperimentError::WeightSum { .. }));

        let bad = VariantConfig::new(1.5, 0.7, 0.15);
        let err = Experiment::new("e", true, vec![named("a", bad)], vec![1.0]).unwrap_err();
        assert!(matches!(err, ExperimentError::InvalidVariant { .. }));

        let bad = VariantConfig::new(0.3, 0.7, 0.0);
        assert!(Experiment::new("e", true, vec![named("a", bad)], vec![1.0]).is_err());

        assert!(matches!(
            Experiment::new("e", true, vec![], vec![]),
            Err(ExperimentError::NoVariants(_))
        ));
    }

    #[test]
    fn test_json_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("variants.json");
        let registry = ExperimentRegistry::builtin();
        let mut rng = StdRng::seed_from_u64(17);

        let mut store = JsonFileStore::new(&path);
        assert_eq!(store.get("anything").unwrap(), None);
        let first = assign_variant(&registry, MATCHING_WEIGHTS_EXPERIMENT, &mut store, &mut rng);

        // A fresh store over the same file sees the same assignment.
        let mut reopened = JsonFileStore::new(&path);
        for _ in 0..5 {
            assert_eq!(assign_variant(&registry, MATCHING_WEIGHTS_EXPERIMENT, &mut reopened, &mut rng), first);
        }
    }

    #[test]
    fn test_json_file_store_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("variants.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(matches!(store.get("k"), Err(StoreError::Format(_))));
    }
}
