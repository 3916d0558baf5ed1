//! Canonical event type constants shared across the hub.
//!
//! Both the persisted event log and the in-process bus use these names, so
//! producers and subscribers never drift apart. Keep this list grouped by
//! section and favor snake_case names; they are part of the stored history.

// Cache (event log entries written by the store itself)
pub const EVENT_CACHE_UPDATE: &str = "cache_update";
pub const EVENT_CACHE_DELETE: &str = "cache_delete";

// Cache (bus notifications for dependents)
pub const TOPIC_CACHE_UPDATED: &str = "cache_updated";
pub const TOPIC_CACHE_DELETED: &str = "cache_deleted";

// Module lifecycle
pub const TOPIC_MODULE_REGISTERED: &str = "module_registered";
pub const TOPIC_MODULE_RUNNING: &str = "module_running";
pub const TOPIC_MODULE_FAILED: &str = "module_failed";

// Home Assistant state stream (fed by the discovery collaborator)
pub const TOPIC_STATE_CHANGED: &str = "state_changed";

// Discovery
pub const TOPIC_DISCOVERY_COMPLETED: &str = "discovery_completed";
pub const TOPIC_ORGANIC_DISCOVERY_COMPLETED: &str = "organic_discovery_completed";

// Capability lifecycle
pub const TOPIC_CAPABILITY_PROMOTED: &str = "capability_promoted";
pub const TOPIC_CAPABILITY_ARCHIVED: &str = "capability_archived";
pub const TOPIC_CAPABILITY_SUGGESTED: &str = "capability_suggested";
pub const TOPIC_DISCOVERY_SETTINGS_UPDATED: &str = "discovery_settings_updated";

// Shadow engine / prediction pipeline
pub const TOPIC_PREDICTION_RECORDED: &str = "prediction_recorded";
pub const TOPIC_PREDICTION_RESOLVED: &str = "prediction_resolved";
pub const TOPIC_SUGGESTION_APPROVED: &str = "suggestion_approved";
pub const TOPIC_SUGGESTION_REJECTED: &str = "suggestion_rejected";
pub const TOPIC_PIPELINE_STAGE_ADVANCED: &str = "pipeline_stage_advanced";
pub const TOPIC_PIPELINE_STAGE_FORCED: &str = "pipeline_stage_forced";
pub const TOPIC_MODELS_TRAINED: &str = "models_trained";

// Cache categories (not topics, but shared the same way)
pub const CATEGORY_ENTITIES: &str = "entities";
pub const CATEGORY_DEVICES: &str = "devices";
pub const CATEGORY_AREAS: &str = "areas";
pub const CATEGORY_CAPABILITIES: &str = "capabilities";
pub const CATEGORY_DISCOVERY_METADATA: &str = "discovery_metadata";
pub const CATEGORY_DISCOVERY_HISTORY: &str = "discovery_history";
pub const CATEGORY_DISCOVERY_SETTINGS: &str = "discovery_settings";
pub const CATEGORY_ML_PREDICTIONS: &str = "ml_predictions";
pub const CATEGORY_ML_TRAINING_METADATA: &str = "ml_training_metadata";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_bus_names_differ() {
        assert_ne!(EVENT_CACHE_UPDATE, TOPIC_CACHE_UPDATED);
        assert_ne!(EVENT_CACHE_DELETE, TOPIC_CACHE_DELETED);
    }
}
