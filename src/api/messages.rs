//! Client-facing API — the endpoint Anthropic-format clients talk to.
//!
//! This is intentionally a thin layer: routing and execution live in
//! [`crate::pipeline`]. Handlers translate HTTP concerns (status codes, JSON
//! bodies, SSE framing) into calls on the pipeline manager and back.
//!
//! Request identity is resolved here, where it is consumed: a caller-supplied
//! `X-Request-ID` (or a fresh UUID v4) names the execution record and the
//! debug artifact, scopes every log line for the request, and is echoed back
//! on the response — success or error alike.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt as _;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;
use uuid::Uuid;

use crate::pipeline::PipelineManager;
use crate::stages::{PayloadBody, SseStream};

/// Optional header naming a route directly, bypassing feature-based selection.
const ROUTE_HINT_HEADER: &str = "x-route-hint";

/// Caller-supplied request identity; generated when absent.
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Build the client-facing axum router.
pub fn router(state: Arc<PipelineManager>) -> Router {
    Router::new()
        .route("/healthz", get(crate::api::status::healthz))
        .route("/status", get(crate::api::status::status))
        .route("/v1/messages", post(messages))
        .with_state(state)
}

/// `POST /v1/messages` — execute an Anthropic Messages request through the
/// selected pipeline.
pub async fn messages(
    State(manager): State<Arc<PipelineManager>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let request_id = header_value(&headers, REQUEST_ID_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let route_hint = header_value(&headers, ROUTE_HINT_HEADER);

    let span = tracing::info_span!("messages", request_id = %request_id);
    let cancel = CancellationToken::new();
    let result = manager
        .handle_request(body, route_hint, &request_id, cancel)
        .instrument(span)
        .await;

    let mut response = match result {
        Ok(payload) => match payload.body {
            PayloadBody::Json(body) => (StatusCode::OK, Json(body)).into_response(),
            PayloadBody::Stream(stream) => sse_response(stream),
        },
        Err(error) => error.into_response(),
    };

    // The same id names the execution record and debug artifact; echo it so
    // clients can correlate.
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn header_value<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn sse_response(stream: SseStream) -> Response {
    let body = axum::body::Body::from_stream(stream.map(|r| r.map_err(std::io::Error::other)));
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(body)
        .expect("static SSE response parts are valid")
}
