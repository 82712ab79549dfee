//! Probe endpoints: fleet readiness (`GET /healthz`) and the full status
//! report (`GET /status`).
//!
//! Intended for the operator of a local relay; responses carry pipeline ids
//! and statuses but never credential material.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::pipeline::PipelineManager;

/// `GET /healthz` — readiness probe over the pipeline fleet.
///
/// Returns 200 while at least one pipeline is accepting requests; 503 once
/// quarantine or assembly failures have taken the whole fleet down. Probes
/// read pipeline status only — no stage health calls, no upstream traffic.
pub async fn healthz(State(manager): State<Arc<PipelineManager>>) -> impl IntoResponse {
    let runnable = manager.runnable_count();
    let (code, verdict) = if runnable > 0 {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };
    (code, Json(json!({ "status": verdict, "runnable_pipelines": runnable })))
}

/// `GET /status` — aggregate health and recent-request counters.
///
/// Example response:
/// ```json
/// {
///   "status": "ok",
///   "healthy": true,
///   "pipelines": [
///     { "pipeline_id": "openrouter_sonnet_default", "status": "runtime", "healthy": true, … }
///   ],
///   "requests": { "total": 42, "failed": 1, "cancelled": 0, "avg_latency_ms": 180.5 }
/// }
/// ```
pub async fn status(State(manager): State<Arc<PipelineManager>>) -> impl IntoResponse {
    let report = manager.health_check();
    let log = manager.observability().log();
    let stats = log.stats().await;
    let recent = log.recent(20).await;

    Json(json!({
        "status": "ok",
        "healthy": report.healthy,
        "pipelines": report.pipelines,
        "requests": {
            "total": stats.total_requests,
            "failed": stats.failed,
            "cancelled": stats.cancelled,
            "avg_latency_ms": stats.avg_latency_ms,
        },
        "recent": recent,
    }))
}
