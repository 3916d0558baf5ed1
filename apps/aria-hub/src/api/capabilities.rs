use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use serde_json::{json, Value};

use crate::capability::{CapabilityError, CapabilityStatus};
use crate::responses::{internal_error, json_ok, not_found, problem_response};
use crate::AppState;
use aria_topics as topics;

/// Capabilities still awaiting a decision, keyed by name.
pub async fn candidates(State(state): State<AppState>) -> Response {
    let hub = state.hub();
    match hub.capabilities().candidates(hub).await {
        Ok(caps) => match serde_json::to_value(caps) {
            Ok(body) => json_ok(body),
            Err(err) => internal_error(err),
        },
        Err(err) => internal_error(format!("{err:#}")),
    }
}

/// Organic discovery run summaries, oldest first.
pub async fn history(State(state): State<AppState>) -> Response {
    match state
        .hub()
        .get_cache(topics::CATEGORY_DISCOVERY_HISTORY)
        .await
    {
        Ok(entry) => {
            let runs = entry
                .map(|e| e.data)
                .filter(Value::is_array)
                .unwrap_or_else(|| json!([]));
            json_ok(runs)
        }
        Err(err) => internal_error(err),
    }
}

pub async fn promote(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    transition(&state, &name, CapabilityStatus::Promoted).await
}

pub async fn archive(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    transition(&state, &name, CapabilityStatus::Archived).await
}

async fn transition(state: &AppState, name: &str, target: CapabilityStatus) -> Response {
    let hub = state.hub();
    let lifecycle = hub.capabilities();
    let res = match target {
        CapabilityStatus::Archived => lifecycle.archive(hub, name).await,
        _ => lifecycle.promote(hub, name).await,
    };
    match res {
        Ok(Ok(())) => json_ok(json!({"capability": name, "status": target.as_str()})),
        Ok(Err(err @ (CapabilityError::NoCapabilities | CapabilityError::Unknown(_)))) => {
            not_found(&err.to_string())
        }
        Ok(Err(err @ CapabilityError::InvalidTransition { .. })) => {
            problem_response(StatusCode::CONFLICT, "Conflict", Some(&err.to_string()))
        }
        Err(err) => internal_error(format!("{err:#}")),
    }
}
