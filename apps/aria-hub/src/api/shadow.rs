use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use aria_kernel::Outcome;
use serde::Deserialize;
use serde_json::json;

use crate::pipeline::DecisionError;
use crate::responses::{internal_error, json_ok, not_found};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn predictions(State(state): State<AppState>, Query(q): Query<PageQuery>) -> Response {
    let limit = q.limit.clamp(1, 1000);
    let offset = q.offset.max(0);
    match state.hub().shadow().recent(limit, offset).await {
        Ok(rows) => json_ok(json!({"count": rows.len(), "predictions": rows})),
        Err(err) => internal_error(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct AccuracyQuery {
    /// Restrict to predictions made in the last N days.
    pub days: Option<i64>,
}

pub async fn accuracy(State(state): State<AppState>, Query(q): Query<AccuracyQuery>) -> Response {
    let hub = state.hub();
    let window = q.days.filter(|d| *d > 0).map(chrono::Duration::days);
    let stats = match hub.shadow().accuracy_stats(window).await {
        Ok(stats) => stats,
        Err(err) => return internal_error(err),
    };
    let stage = match hub.pipeline().current_stage().await {
        Ok(stage) => stage,
        Err(err) => return internal_error(err),
    };
    json_ok(json!({
        "overall_accuracy": stats.overall_accuracy,
        "predictions_total": stats.total_resolved,
        "predictions_correct": stats.count(Outcome::Correct),
        "predictions_disagreement": stats.count(Outcome::Disagreement),
        "predictions_nothing": stats.count(Outcome::Nothing),
        "by_type": stats.by_type,
        "stage": stage.as_str(),
        "daily_trend": stats.daily_trend,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_disagreements")]
    pub limit: usize,
}

fn default_disagreements() -> usize {
    20
}

pub async fn disagreements(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> Response {
    match state.hub().shadow().disagreements(q.limit).await {
        Ok(rows) => json_ok(json!({"count": rows.len(), "disagreements": rows})),
        Err(err) => internal_error(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct DecisionReq {
    pub approved: bool,
}

/// Record a human decision on a suggested action; feeds the approval gate.
/// Unknown predictions are a 404.
pub async fn suggestion_decision(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<DecisionReq>,
) -> Response {
    match state
        .hub()
        .pipeline()
        .record_suggestion_decision(&id, req.approved)
        .await
    {
        Ok(first) => json_ok(json!({
            "prediction_id": id,
            "approved": req.approved,
            "first_decision": first,
        })),
        Err(err @ DecisionError::UnknownPrediction(_)) => not_found(&err.to_string()),
        Err(err) => internal_error(err),
    }
}
