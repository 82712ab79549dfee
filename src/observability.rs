//! Observability — per-request debug artifacts and the rolling request log.
//!
//! Every completed request hands its execution record here exactly once. The
//! sink keeps a bounded in-memory ring of summaries (backing `GET /status`)
//! and, when debug mode is on, writes the full record to
//! `<debugDir>/port-<port>/<sessionId>/requests/req_<id>.json` with redaction
//! applied. Redaction happens only at write time; payloads inside the
//! pipeline are never rewritten.

use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::OnceLock,
};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::ServerSettings;
use crate::execution::{ExecutionRecord, ExecutionStatus};

/// Summaries retained in memory for the status endpoint.
const LOG_CAPACITY: usize = 500;

/// One line per completed request — enough for the status endpoint, nothing
/// sensitive.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub request_id: String,
    pub pipeline_id: String,
    pub timestamp: DateTime<Utc>,
    pub total_time_ms: u64,
    pub status: ExecutionStatus,
    pub stage_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

/// Fixed-capacity ring-buffer of recent [`RequestSummary`] records.
///
/// `push` uses a non-blocking `try_lock` so it never delays request handling;
/// under contention the entry is silently dropped.
pub struct RequestLog {
    capacity: usize,
    entries: Mutex<VecDeque<RequestSummary>>,
}

impl RequestLog {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    pub fn push(&self, entry: RequestSummary) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Up to `limit` recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<RequestSummary> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub async fn stats(&self) -> LogStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.total_time_ms as f64).sum::<f64>() / total as f64
        };
        let failed = entries.iter().filter(|e| e.status == ExecutionStatus::Failed).count();
        let cancelled =
            entries.iter().filter(|e| e.status == ExecutionStatus::Cancelled).count();

        let mut pipeline_counts: std::collections::HashMap<String, usize> =
            std::collections::HashMap::new();
        for entry in entries.iter() {
            *pipeline_counts.entry(entry.pipeline_id.clone()).or_default() += 1;
        }

        LogStats { total_requests: total, failed, cancelled, avg_latency_ms, pipeline_counts }
    }
}

#[derive(Debug, Serialize)]
pub struct LogStats {
    pub total_requests: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub avg_latency_ms: f64,
    pub pipeline_counts: std::collections::HashMap<String, usize>,
}

/// Destination for completed execution records.
pub struct DebugSink {
    artifact_dir: Option<PathBuf>,
    log: RequestLog,
    #[cfg(test)]
    pub(crate) captured: std::sync::Mutex<Vec<ExecutionRecord>>,
}

impl DebugSink {
    pub fn new(settings: &ServerSettings) -> Self {
        let artifact_dir = settings.debug.then(|| {
            let root = settings.debug_dir.clone().unwrap_or_else(default_debug_root);
            let session_id = uuid::Uuid::new_v4().simple().to_string();
            root.join(format!("port-{}", settings.port)).join(session_id).join("requests")
        });
        Self {
            artifact_dir,
            log: RequestLog::new(LOG_CAPACITY),
            #[cfg(test)]
            captured: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// A sink that keeps summaries but writes no artifacts.
    #[cfg(test)]
    pub(crate) fn disabled() -> Self {
        Self {
            artifact_dir: None,
            log: RequestLog::new(LOG_CAPACITY),
            #[cfg(test)]
            captured: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn log(&self) -> &RequestLog {
        &self.log
    }

    /// Take ownership of a completed record. Ordered per request by
    /// construction — each record is emitted exactly once, by its own task.
    pub fn emit(&self, record: ExecutionRecord) {
        self.log.push(RequestSummary {
            request_id: record.request_id.clone(),
            pipeline_id: record.pipeline_id.clone(),
            timestamp: record.start_time,
            total_time_ms: record.total_time_ms,
            status: record.status,
            stage_count: record.stage_executions.len(),
            error_kind: record
                .error
                .as_ref()
                .and_then(|e| e["kind"].as_str())
                .map(str::to_string),
        });

        #[cfg(test)]
        self.captured.lock().expect("captured lock poisoned").push(record.clone());

        if let Some(dir) = self.artifact_dir.clone() {
            // Keep file I/O off the request path.
            tokio::task::spawn_blocking(move || {
                if let Err(e) = write_artifact(&dir, &record) {
                    warn!(error = %e, "failed to write debug artifact");
                }
            });
        }
    }
}

fn default_debug_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".llm-relay").join("debug"))
        .unwrap_or_else(|| std::env::temp_dir().join("llm-relay"))
}

pub(crate) fn write_artifact(dir: &std::path::Path, record: &ExecutionRecord) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut value = serde_json::to_value(record)?;
    redact_value(&mut value);
    let path = dir.join(format!("req_{}.json", sanitize_id(&record.request_id)));
    std::fs::write(path, serde_json::to_vec_pretty(&value)?)?;
    Ok(())
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

// ---------------------------------------------------------------------------
// Redaction
// ---------------------------------------------------------------------------
//
// A finite, documented rule set — one key pattern plus two value patterns:
//   keys:   /api[_-]?key|authorization|token|secret|password/i
//   values: Bearer tokens; long base64/hex runs (32+ chars)

fn key_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)api[_-]?key|authorization|token|secret|password").expect("key pattern")
    })
}

fn bearer_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Bearer\s+[A-Za-z0-9._~+/=-]+").expect("bearer pattern"))
}

fn long_run_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Classic base64/hex alphabet only: UUIDs and kebab-case ids segment on
    // `-` and stay visible.
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9+/]{32,}={0,2}").expect("long-run pattern"))
}

/// Replace credential-like content with `"[FILTERED]"`, recursively.
pub(crate) fn redact_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if key_pattern().is_match(key) {
                    *entry = json!("[FILTERED]");
                } else {
                    redact_value(entry);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_value(item);
            }
        }
        Value::String(s) => {
            let pass = bearer_pattern().replace_all(s, "[FILTERED]");
            let pass = long_run_pattern().replace_all(&pass, "[FILTERED]");
            if pass != *s {
                *s = pass.into_owned();
            }
        }
        _ => {}
    }
}
