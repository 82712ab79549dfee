//! Per-request execution records and the request context.
//!
//! An [`ExecutionRecord`] is exclusively owned by the task executing the
//! request; it collects one [`StageExecution`] per stage invocation and is
//! handed to the observability sink exactly once, on completion. Records are
//! never shared between requests.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::stages::StageTag;

/// Cancellation and deadline state carried alongside a request.
///
/// Checked at stage boundaries by the pipeline runtime and inside the Server
/// stage's retry loop.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>, timeout: Duration, cancel: CancellationToken) -> Self {
        Self { request_id: request_id.into(), cancel, deadline: Instant::now() + timeout }
    }

    /// Time left before the per-request deadline, `None` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.checked_duration_since(Instant::now())
    }

    /// Boundary check: cancelled requests and passed deadlines stop the
    /// pipeline before the next stage runs.
    pub fn ensure_active(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if self.remaining().is_none() {
            return Err(PipelineError::Timeout);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One stage invocation: direction, payload snapshots, timing, outcome.
#[derive(Debug, Clone, Serialize)]
pub struct StageExecution {
    pub stage: StageTag,
    pub direction: Direction,
    pub input: Value,
    pub output: Value,
    pub duration_ms: u64,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// The full trace of one request through a pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub request_id: String,
    pub pipeline_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing)]
    started: Instant,
    pub stage_executions: Vec<StageExecution>,
    pub total_time_ms: u64,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ExecutionRecord {
    pub fn new(request_id: impl Into<String>, pipeline_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            pipeline_id: pipeline_id.into(),
            start_time: Utc::now(),
            started: Instant::now(),
            stage_executions: Vec::with_capacity(8),
            total_time_ms: 0,
            status: ExecutionStatus::Running,
            error: None,
        }
    }

    pub fn push_success(
        &mut self,
        stage: StageTag,
        direction: Direction,
        input: Value,
        output: Value,
        duration: Duration,
    ) {
        self.stage_executions.push(StageExecution {
            stage,
            direction,
            input,
            output,
            duration_ms: duration.as_millis() as u64,
            status: StageStatus::Completed,
            error: None,
        });
    }

    pub fn push_failure(
        &mut self,
        stage: StageTag,
        direction: Direction,
        input: Value,
        error: &PipelineError,
        duration: Duration,
    ) {
        self.stage_executions.push(StageExecution {
            stage,
            direction,
            input,
            output: Value::Null,
            duration_ms: duration.as_millis() as u64,
            status: StageStatus::Failed,
            error: Some(error_json(error)),
        });
    }

    /// Seal the record with a terminal status.
    pub fn finish(&mut self, outcome: Result<(), &PipelineError>) {
        self.total_time_ms = self.started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => self.status = ExecutionStatus::Completed,
            Err(PipelineError::Cancelled) => {
                self.status = ExecutionStatus::Cancelled;
                self.error = Some(error_json(&PipelineError::Cancelled));
            }
            Err(e) => {
                self.status = ExecutionStatus::Failed;
                self.error = Some(error_json(e));
            }
        }
    }
}

/// Structured error details for records: kind, message, source, context.
pub fn error_json(error: &PipelineError) -> Value {
    json!({
        "kind": error.kind(),
        "message": error.to_string(),
        "source": error.source_component(),
        "context": error.context(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_starts_running_with_no_stages() {
        let record = ExecutionRecord::new("req-1", "p_m_default");
        assert_eq!(record.status, ExecutionStatus::Running);
        assert!(record.stage_executions.is_empty());
    }

    #[test]
    fn finish_marks_completed_and_totals_time() {
        let mut record = ExecutionRecord::new("req-1", "p");
        record.finish(Ok(()));
        assert_eq!(record.status, ExecutionStatus::Completed);
    }

    #[test]
    fn finish_with_error_captures_details() {
        let mut record = ExecutionRecord::new("req-1", "p");
        let err = PipelineError::Transform("bad shape".into());
        record.finish(Err(&err));
        assert_eq!(record.status, ExecutionStatus::Failed);
        let detail = record.error.unwrap();
        assert_eq!(detail["kind"], "transform_error");
        assert_eq!(detail["source"], "transformer");
    }

    #[test]
    fn cancellation_is_its_own_terminal_status() {
        let mut record = ExecutionRecord::new("req-1", "p");
        record.finish(Err(&PipelineError::Cancelled));
        assert_eq!(record.status, ExecutionStatus::Cancelled);
    }

    #[test]
    fn failed_stage_keeps_error_and_null_output() {
        let mut record = ExecutionRecord::new("req-1", "p");
        let err = PipelineError::Protocol("no url".into());
        record.push_failure(
            StageTag::Protocol,
            Direction::Forward,
            json!({ "model": "m" }),
            &err,
            Duration::from_millis(3),
        );
        let entry = &record.stage_executions[0];
        assert_eq!(entry.status, StageStatus::Failed);
        assert_eq!(entry.output, Value::Null);
        assert_eq!(entry.error.as_ref().unwrap()["kind"], "protocol_error");
    }

    #[test]
    fn context_reports_remaining_deadline() {
        let ctx = RequestContext::new(
            "req-1",
            Duration::from_secs(60),
            CancellationToken::new(),
        );
        assert!(ctx.remaining().unwrap() > Duration::from_secs(59));
        assert!(ctx.ensure_active().is_ok());
    }

    #[test]
    fn cancelled_context_fails_boundary_check() {
        let token = CancellationToken::new();
        let ctx = RequestContext::new("req-1", Duration::from_secs(60), token.clone());
        token.cancel();
        assert!(matches!(ctx.ensure_active(), Err(PipelineError::Cancelled)));
    }

    #[test]
    fn expired_deadline_fails_boundary_check() {
        let ctx = RequestContext::new("req-1", Duration::ZERO, CancellationToken::new());
        assert!(matches!(ctx.ensure_active(), Err(PipelineError::Timeout)));
    }
}
