use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Component weights; they sum to 1.0.
pub const WEIGHTS: [(&str, f64); 5] = [
    ("predictability", 0.30),
    ("stability", 0.25),
    ("entity_coverage", 0.15),
    ("activity", 0.15),
    ("cohesion", 0.15),
];

/// Raw component scores for one capability, each nominally in 0.0..=1.0.
///
/// - `predictability`: model accuracy over the cluster's entities
/// - `stability`: how consistently the cluster reappears across windows
/// - `entity_coverage`: share of all entities that fall in the cluster
/// - `activity`: normalized daily state changes
/// - `cohesion`: silhouette of the cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsefulnessComponents {
    pub predictability: f64,
    pub stability: f64,
    pub entity_coverage: f64,
    pub activity: f64,
    pub cohesion: f64,
}

fn clamp01(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

impl UsefulnessComponents {
    fn values(&self) -> [f64; 5] {
        [
            self.predictability,
            self.stability,
            self.entity_coverage,
            self.activity,
            self.cohesion,
        ]
    }

    /// Each clamped component as a 0-100 integer, keyed by component name.
    pub fn to_percentages(&self) -> BTreeMap<String, i64> {
        WEIGHTS
            .iter()
            .zip(self.values())
            .map(|((name, _), v)| (name.to_string(), (clamp01(v) * 100.0).round() as i64))
            .collect()
    }
}

/// Weighted sum of the clamped components, scaled to 0-100 and rounded.
pub fn compute_usefulness(components: &UsefulnessComponents) -> i64 {
    let score: f64 = WEIGHTS
        .iter()
        .zip(components.values())
        .map(|((_, w), v)| clamp01(v) * w)
        .sum();
    (score * 100.0).round() as i64
}
