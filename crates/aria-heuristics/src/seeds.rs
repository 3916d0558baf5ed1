use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Jaccard similarity at or above which a cluster reproduces a seed.
pub const MATCH_THRESHOLD: f64 = 0.8;

/// |A ∩ B| / |A ∪ B|, defined as 0 when both sets are empty.
pub fn jaccard_similarity<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedValidation {
    pub best_jaccard: f64,
    pub best_cluster_id: Option<i64>,
    pub matched: bool,
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Compare every seed's entity set against each cluster. `clusters` pairs a
/// cluster id with its entity ids.
pub fn validate_seeds(
    seeds: &BTreeMap<String, BTreeSet<String>>,
    clusters: &[(i64, BTreeSet<String>)],
    threshold: f64,
) -> BTreeMap<String, SeedValidation> {
    let mut out = BTreeMap::new();
    for (name, seed_entities) in seeds {
        let mut best = 0.0;
        let mut best_id = None;
        for (cluster_id, entities) in clusters {
            let sim = jaccard_similarity(seed_entities, entities);
            if sim > best {
                best = sim;
                best_id = Some(*cluster_id);
            }
        }
        let matched = best >= threshold;
        if !matched && !seed_entities.is_empty() {
            warn!(
                seed = %name,
                best_jaccard = %format_args!("{best:.2}"),
                threshold,
                "seed capability not reproduced by clustering"
            );
        }
        out.insert(
            name.clone(),
            SeedValidation {
                best_jaccard: round4(best),
                best_cluster_id: best_id,
                matched,
            },
        );
    }
    out
}

/// Seed a cluster rediscovers, if any: the most similar seed whose similarity
/// reaches `threshold`. Ties resolve to the first name in order.
pub fn best_seed_match<'a>(
    cluster: &BTreeSet<String>,
    seeds: &'a BTreeMap<String, BTreeSet<String>>,
    threshold: f64,
) -> Option<(&'a str, f64)> {
    let mut best: Option<(&'a str, f64)> = None;
    for (name, entities) in seeds {
        let sim = jaccard_similarity(cluster, entities);
        if sim >= threshold && best.map_or(true, |(_, b)| sim > b) {
            best = Some((name.as_str(), sim));
        }
    }
    best
}
