use std::fmt::Display;

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde_json::{json, Value};
use tracing::error;

/// RFC 7807-style problem body.
pub fn problem_response(status: StatusCode, title: &str, detail: Option<&str>) -> Response {
    let mut body = json!({"type": "about:blank", "title": title, "status": status.as_u16()});
    if let Some(d) = detail {
        body["detail"] = json!(d);
    }
    (status, Json(body)).into_response()
}

pub fn json_ok(body: Value) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}

pub fn not_found(detail: &str) -> Response {
    problem_response(StatusCode::NOT_FOUND, "Not Found", Some(detail))
}

pub fn bad_request(detail: &str) -> Response {
    problem_response(StatusCode::BAD_REQUEST, "Bad Request", Some(detail))
}

/// 500 for store and collaborator failures; the cause is logged.
pub fn internal_error(err: impl Display) -> Response {
    let detail = err.to_string();
    error!(error = %detail, "request failed");
    problem_response(StatusCode::INTERNAL_SERVER_ERROR, "Error", Some(&detail))
}
