use std::collections::BTreeMap;

use axum::extract::State;
use axum::response::Response;
use serde_json::json;

use crate::responses::json_ok;
use crate::AppState;

/// Liveness plus the status of every registered module.
pub async fn health(State(state): State<AppState>) -> Response {
    let modules: BTreeMap<String, &'static str> = state
        .hub()
        .registry()
        .snapshot()
        .into_iter()
        .map(|m| (m.name, m.status.as_str()))
        .collect();
    json_ok(json!({"status": "ok", "modules": modules}))
}

pub async fn tasks(State(state): State<AppState>) -> Response {
    let hub = state.hub();
    json_ok(json!({
        "tasks": hub.scheduler().snapshot(),
        "modules": hub.registry().snapshot(),
    }))
}
