//! Pure scoring and matching helpers used by capability discovery.

pub mod scoring;
pub mod seeds;

pub use scoring::{compute_usefulness, UsefulnessComponents, WEIGHTS};
pub use seeds::{best_seed_match, jaccard_similarity, validate_seeds, SeedValidation, MATCH_THRESHOLD};
