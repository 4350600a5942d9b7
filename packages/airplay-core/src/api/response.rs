//! Success response envelopes shared by the HTTP handlers.
//!
//! Errors are rendered by [`SpeakerError`](crate::error::SpeakerError)'s
//! `IntoResponse` impl; everything else goes through these helpers so every
//! success body has the same `{success: true, data}` shape.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

/// `200 OK` with `{success: true, data}`.
pub fn api_success<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(json!({ "success": true, "data": data }))).into_response()
}

/// `202 Accepted` with `{success: true, data}` for work that completes in the background.
pub fn api_accepted<T: Serialize>(data: T) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "data": data })),
    )
        .into_response()
}

/// `200 OK` with `{success: true}` and no payload.
pub fn api_ok() -> Response {
    (StatusCode::OK, Json(json!({ "success": true }))).into_response()
}
