use axum::extract::{Path, Query, State};
use axum::response::Response;
use aria_kernel::EventQuery;
use serde::Deserialize;
use serde_json::json;

use crate::responses::{internal_error, json_ok, not_found};
use crate::AppState;

pub async fn categories(State(state): State<AppState>) -> Response {
    match state.hub().kernel().list_categories_async().await {
        Ok(names) => json_ok(json!({"categories": names})),
        Err(err) => internal_error(err),
    }
}

pub async fn entry(State(state): State<AppState>, Path(category): Path<String>) -> Response {
    match state.hub().get_cache(&category).await {
        Ok(Some(entry)) => json_ok(json!(entry)),
        Ok(None) => not_found(&format!("Category not found: {category}")),
        Err(err) => internal_error(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub event_type: Option<String>,
    pub category: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

pub async fn events(State(state): State<AppState>, Query(q): Query<EventsQuery>) -> Response {
    let query = EventQuery {
        event_type: q.event_type,
        category: q.category,
        limit: q.limit.clamp(1, 1000),
    };
    match state.hub().kernel().get_events_async(query).await {
        Ok(rows) => json_ok(json!({"count": rows.len(), "events": rows})),
        Err(err) => internal_error(err),
    }
}
