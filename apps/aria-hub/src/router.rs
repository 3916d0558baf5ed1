use axum::{
    routing::{get, post, put},
    Router,
};

use crate::{api, AppState};

pub mod paths {
    pub const HEALTH: &str = "/health";
    pub const TASKS: &str = "/api/tasks";
    pub const CACHE: &str = "/api/cache";
    pub const CACHE_CATEGORY: &str = "/api/cache/{category}";
    pub const EVENTS: &str = "/api/events";

    pub const CAPABILITY_CANDIDATES: &str = "/api/capabilities/candidates";
    pub const CAPABILITY_HISTORY: &str = "/api/capabilities/history";
    pub const CAPABILITY_PROMOTE: &str = "/api/capabilities/{name}/promote";
    pub const CAPABILITY_ARCHIVE: &str = "/api/capabilities/{name}/archive";
    pub const SETTINGS_DISCOVERY: &str = "/api/settings/discovery";
    pub const DISCOVERY_RUN: &str = "/api/discovery/run";
    pub const DISCOVERY_STATUS: &str = "/api/discovery/status";

    pub const SHADOW_PREDICTIONS: &str = "/api/shadow/predictions";
    pub const SHADOW_ACCURACY: &str = "/api/shadow/accuracy";
    pub const SHADOW_DISAGREEMENTS: &str = "/api/shadow/disagreements";
    pub const SHADOW_SUGGESTION: &str = "/api/shadow/suggestions/{id}";
    pub const PIPELINE: &str = "/api/pipeline";
    pub const PIPELINE_STAGE: &str = "/api/pipeline/stage";
}

pub(crate) fn build_router() -> Router<AppState> {
    Router::new()
        .route(paths::HEALTH, get(api::meta::health))
        .route(paths::TASKS, get(api::meta::tasks))
        .route(paths::CACHE, get(api::cache::categories))
        .route(paths::CACHE_CATEGORY, get(api::cache::entry))
        .route(paths::EVENTS, get(api::cache::events))
        .route(
            paths::CAPABILITY_CANDIDATES,
            get(api::capabilities::candidates),
        )
        .route(paths::CAPABILITY_HISTORY, get(api::capabilities::history))
        .route(paths::CAPABILITY_PROMOTE, put(api::capabilities::promote))
        .route(paths::CAPABILITY_ARCHIVE, put(api::capabilities::archive))
        .route(
            paths::SETTINGS_DISCOVERY,
            get(api::discovery::settings_get).put(api::discovery::settings_put),
        )
        .route(paths::DISCOVERY_RUN, post(api::discovery::run))
        .route(paths::DISCOVERY_STATUS, get(api::discovery::status))
        .route(paths::SHADOW_PREDICTIONS, get(api::shadow::predictions))
        .route(paths::SHADOW_ACCURACY, get(api::shadow::accuracy))
        .route(paths::SHADOW_DISAGREEMENTS, get(api::shadow::disagreements))
        .route(paths::SHADOW_SUGGESTION, post(api::shadow::suggestion_decision))
        .route(paths::PIPELINE, get(api::pipeline::pipeline_get))
        .route(paths::PIPELINE_STAGE, put(api::pipeline::stage_put))
}
