use std::sync::Arc;

use axum::extract::State;
use axum::response::Response;
use axum::Json;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::organic_discovery::{OrganicDiscoveryModule, SettingsError, MODULE_NAME};
use crate::responses::{bad_request, internal_error, json_ok, not_found};
use crate::AppState;

const NOT_LOADED: &str = "Organic discovery module not loaded";

fn module(state: &AppState) -> Option<Arc<OrganicDiscoveryModule>> {
    state.hub().module_as::<OrganicDiscoveryModule>(MODULE_NAME)
}

pub async fn settings_get(State(state): State<AppState>) -> Response {
    match module(&state) {
        Some(m) => json_ok(json!(m.settings())),
        None => json_ok(json!({"error": NOT_LOADED})),
    }
}

pub async fn settings_put(State(state): State<AppState>, Json(patch): Json<Value>) -> Response {
    let Some(m) = module(&state) else {
        return not_found(NOT_LOADED);
    };
    match m.update_settings(state.hub(), &patch).await {
        Ok(settings) => json_ok(json!({"status": "updated", "settings": settings})),
        Err(SettingsError::Invalid(detail)) => bad_request(&detail),
        Err(err @ SettingsError::Store(_)) => internal_error(err),
    }
}

/// Start a discovery pass in the background.
pub async fn run(State(state): State<AppState>) -> Response {
    let Some(m) = module(&state) else {
        return not_found(NOT_LOADED);
    };
    let hub = state.hub().clone();
    tokio::spawn(async move {
        if let Err(err) = m.run(&hub).await {
            warn!(error = %format!("{err:#}"), "manual discovery run failed");
        }
    });
    info!("manual discovery run started");
    json_ok(json!({"status": "started"}))
}

pub async fn status(State(state): State<AppState>) -> Response {
    match module(&state) {
        Some(m) => {
            let history = m.history();
            json_ok(json!({
                "loaded": true,
                "last_run": history.last().map(|run| run.timestamp.clone()),
                "total_runs": history.len(),
                "settings": m.settings(),
            }))
        }
        None => json_ok(json!({
            "loaded": false,
            "last_run": null,
            "total_runs": 0,
            "settings": null,
        })),
    }
}
