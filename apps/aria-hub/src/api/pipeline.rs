use axum::extract::State;
use axum::response::Response;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::pipeline::Stage;
use crate::responses::{bad_request, internal_error, json_ok};
use crate::AppState;

pub async fn pipeline_get(State(state): State<AppState>) -> Response {
    let pipeline = state.hub().pipeline();
    match pipeline.state().await {
        Ok(Some(current)) => {
            let gates = pipeline.gates_view(&current);
            let mut body = json!(current);
            body["gates"] = gates;
            json_ok(body)
        }
        Ok(None) => json_ok(json!({
            "current_stage": Stage::default().as_str(),
            "gates": {},
            "message": "Pipeline not initialized",
        })),
        Err(err) => internal_error(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct StageReq {
    pub stage: String,
}

/// Manual stage override.
pub async fn stage_put(State(state): State<AppState>, Json(req): Json<StageReq>) -> Response {
    let Ok(stage) = req.stage.parse::<Stage>() else {
        return bad_request(&format!("unknown stage: {}", req.stage));
    };
    match state.hub().pipeline().force_stage(stage, Utc::now()).await {
        Ok(()) => json_ok(json!({"status": "updated", "current_stage": stage.as_str()})),
        Err(err) => internal_error(err),
    }
}
