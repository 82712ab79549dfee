//! Pipeline runtime and the pipeline manager.
//!
//! A [`Pipeline`] drives one request through its four stages: forward in
//! order, then back in reverse. Stages hold only immutable configuration, so
//! a pipeline may be entered by any number of requests concurrently; the only
//! per-request state is the [`ExecutionRecord`] owned by the executing task.
//!
//! The [`PipelineManager`] owns the pipeline set, maps routes to pipelines,
//! and is the authoritative runtime entry point. Status is checked before any
//! stage runs — a quarantined pipeline rejects in constant time.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::compiler::PipelineConfig;
use crate::error::PipelineError;
use crate::execution::{Direction, ExecutionRecord, RequestContext};
use crate::observability::DebugSink;
use crate::routing::{self, RoutingFeatures};
use crate::stages::{Payload, StageModule};

/// Total per-request deadline enforced by the runtime.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStatus {
    Initializing,
    Runtime,
    Quarantined { reason: String },
    Stopped,
    Error { reason: String },
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Runtime => "runtime",
            Self::Quarantined { .. } => "quarantined",
            Self::Stopped => "stopped",
            Self::Error { .. } => "error",
        }
    }

    fn reason(&self) -> &str {
        match self {
            Self::Quarantined { reason } | Self::Error { reason } => reason,
            _ => "not accepting requests",
        }
    }
}

/// One provider·model·credential request path.
pub struct Pipeline {
    config: PipelineConfig,
    stages: Vec<StageModule>,
    status: RwLock<PipelineStatus>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, stages: Vec<StageModule>) -> Self {
        Self { config, stages, status: RwLock::new(PipelineStatus::Initializing) }
    }

    pub fn id(&self) -> &str {
        &self.config.pipeline_id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn status(&self) -> PipelineStatus {
        self.status.read().expect("status lock poisoned").clone()
    }

    pub(crate) fn set_status(&self, status: PipelineStatus) {
        *self.status.write().expect("status lock poisoned") = status;
    }

    /// Run every stage's start hook; the first failure wins.
    pub(crate) fn start_all(&self) -> Result<(), (crate::stages::StageTag, anyhow::Error)> {
        for stage in &self.stages {
            stage.start().map_err(|e| (stage.tag(), e))?;
        }
        Ok(())
    }

    /// True only for a runnable pipeline whose stages all report healthy.
    pub fn health(&self) -> bool {
        self.status() == PipelineStatus::Runtime && self.stages.iter().all(StageModule::health)
    }

    pub fn stop(&self) {
        for stage in &self.stages {
            stage.stop();
        }
        self.set_status(PipelineStatus::Stopped);
    }

    /// Drive one request through the forward path and the back path,
    /// recording every stage invocation. Strictly sequential within the
    /// request; freely concurrent across requests.
    async fn execute(
        &self,
        request: Value,
        ctx: &RequestContext,
        record: &mut ExecutionRecord,
    ) -> Result<Payload, PipelineError> {
        let mut payload = Payload::json(request);

        for stage in &self.stages {
            ctx.ensure_active()?;
            payload = run_stage(stage, Direction::Forward, payload, ctx, record).await?;
        }
        for stage in self.stages.iter().rev() {
            ctx.ensure_active()?;
            payload = run_stage(stage, Direction::Back, payload, ctx, record).await?;
        }

        Ok(payload)
    }
}

async fn run_stage(
    stage: &StageModule,
    direction: Direction,
    payload: Payload,
    ctx: &RequestContext,
    record: &mut ExecutionRecord,
) -> Result<Payload, PipelineError> {
    let input = payload.snapshot();
    let started = Instant::now();
    let result = match direction {
        Direction::Forward => stage.forward(payload, ctx).await,
        Direction::Back => stage.back(payload, ctx).await,
    };
    match result {
        Ok(output) => {
            record.push_success(stage.tag(), direction, input, output.snapshot(), started.elapsed());
            Ok(output)
        }
        Err(error) => {
            record.push_failure(stage.tag(), direction, input, &error, started.elapsed());
            Err(error)
        }
    }
}

/// Events published by the manager; the self-check loop subscribes.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Quarantined { pipeline_id: String, reason: String },
    Resumed { pipeline_id: String },
}

/// Per-pipeline entry in a health report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineHealth {
    pub pipeline_id: String,
    pub route_id: String,
    pub provider: String,
    pub model: String,
    pub status: String,
    pub healthy: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub pipelines: Vec<PipelineHealth>,
}

/// Owner of the pipeline fleet and the runtime entry point.
pub struct PipelineManager {
    pipelines: DashMap<String, Arc<Pipeline>>,
    /// Route name → pipeline id. Written during assembly, read per request.
    routes: RwLock<HashMap<String, String>>,
    observability: Arc<DebugSink>,
    events: broadcast::Sender<PipelineEvent>,
    deadline: Duration,
}

impl PipelineManager {
    pub fn new(observability: Arc<DebugSink>) -> Arc<Self> {
        Arc::new(Self {
            pipelines: DashMap::new(),
            routes: RwLock::new(HashMap::new()),
            observability,
            events: broadcast::channel(64).0,
            deadline: REQUEST_DEADLINE,
        })
    }

    pub fn observability(&self) -> &Arc<DebugSink> {
        &self.observability
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn add_pipeline(&self, pipeline: Arc<Pipeline>) {
        self.routes
            .write()
            .expect("routes lock poisoned")
            .insert(pipeline.config().route_id.clone(), pipeline.id().to_string());
        self.pipelines.insert(pipeline.id().to_string(), pipeline);
    }

    pub fn remove_pipeline(&self, pipeline_id: &str) -> bool {
        let Some((_, pipeline)) = self.pipelines.remove(pipeline_id) else {
            return false;
        };
        pipeline.stop();
        self.routes
            .write()
            .expect("routes lock poisoned")
            .retain(|_, id| id.as_str() != pipeline_id);
        true
    }

    pub fn pipeline(&self, pipeline_id: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.get(pipeline_id).map(|entry| Arc::clone(&entry))
    }

    pub fn pipeline_ids(&self) -> Vec<String> {
        self.pipelines.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of pipelines currently accepting requests.
    pub fn runnable_count(&self) -> usize {
        self.pipelines
            .iter()
            .filter(|entry| entry.value().status() == PipelineStatus::Runtime)
            .count()
    }

    /// Pipeline backing a route name, if any.
    pub fn route_target(&self, route: &str) -> Option<String> {
        self.routes.read().expect("routes lock poisoned").get(route).cloned()
    }

    /// Route-selection helper for the HTTP collaborator.
    pub fn select_route(&self, features: &RoutingFeatures) -> String {
        routing::select_route(features, |route| self.route_target(route).is_some())
    }

    /// Entry point for the HTTP collaborator: resolve a route (hinted or
    /// derived from features) and execute the backing pipeline.
    pub async fn handle_request(
        &self,
        request: Value,
        route_hint: Option<&str>,
        request_id: &str,
        cancel: CancellationToken,
    ) -> Result<Payload, PipelineError> {
        let route = match route_hint {
            Some(hint) => hint.to_string(),
            None => self.select_route(&RoutingFeatures::from_request(&request)),
        };
        let pipeline_id = self
            .route_target(&route)
            .or_else(|| {
                warn!(%route, "no pipeline for route — falling back to default");
                self.route_target("default")
            })
            .ok_or_else(|| PipelineError::PipelineNotFound(route.clone()))?;

        let ctx = RequestContext::new(request_id, self.deadline, cancel);
        self.execute_pipeline(&pipeline_id, request, ctx).await
    }

    /// The authoritative runtime entry. Fails fast — before any stage runs —
    /// when the pipeline is missing or not in `runtime` status. An execution
    /// record is emitted on every path, including the failing ones.
    pub async fn execute_pipeline(
        &self,
        pipeline_id: &str,
        request: Value,
        ctx: RequestContext,
    ) -> Result<Payload, PipelineError> {
        let mut record = ExecutionRecord::new(&ctx.request_id, pipeline_id);

        let Some(pipeline) = self.pipeline(pipeline_id) else {
            let error = PipelineError::PipelineNotFound(pipeline_id.to_string());
            record.finish(Err(&error));
            self.observability.emit(record);
            return Err(error);
        };

        let status = pipeline.status();
        if status != PipelineStatus::Runtime {
            let error = PipelineError::PipelineUnavailable {
                id: pipeline_id.to_string(),
                status: status.as_str().to_string(),
                reason: status.reason().to_string(),
            };
            record.finish(Err(&error));
            self.observability.emit(record);
            return Err(error);
        }

        match pipeline.execute(request, &ctx, &mut record).await {
            Ok(payload) => {
                record.finish(Ok(()));
                self.observability.emit(record);
                Ok(payload)
            }
            Err(error) => {
                record.finish(Err(&error));
                self.observability.emit(record);
                Err(error)
            }
        }
    }

    /// Reversibly suspend a pipeline. In-flight requests finish; new ones are
    /// rejected until `resume`.
    pub fn quarantine(&self, pipeline_id: &str, reason: &str) -> bool {
        let Some(pipeline) = self.pipeline(pipeline_id) else { return false };
        pipeline.set_status(PipelineStatus::Quarantined { reason: reason.to_string() });
        warn!(%pipeline_id, %reason, "pipeline quarantined");
        let _ = self.events.send(PipelineEvent::Quarantined {
            pipeline_id: pipeline_id.to_string(),
            reason: reason.to_string(),
        });
        true
    }

    /// Lift a quarantine. Pipelines in `error` stay down — they never had a
    /// clean start to return to.
    pub fn resume(&self, pipeline_id: &str) -> bool {
        let Some(pipeline) = self.pipeline(pipeline_id) else { return false };
        if !matches!(pipeline.status(), PipelineStatus::Quarantined { .. }) {
            return false;
        }
        pipeline.set_status(PipelineStatus::Runtime);
        info!(%pipeline_id, "pipeline resumed");
        let _ = self.events.send(PipelineEvent::Resumed { pipeline_id: pipeline_id.to_string() });
        true
    }

    /// Quarantine every pipeline bound to a credential.
    pub fn quarantine_dependents(&self, credential_ref: &str, reason: &str) {
        for entry in self.pipelines.iter() {
            if entry.value().config().credential_ref == credential_ref {
                self.quarantine(entry.key(), reason);
            }
        }
    }

    /// Resume every quarantined pipeline bound to a credential.
    pub fn resume_dependents(&self, credential_ref: &str) {
        for entry in self.pipelines.iter() {
            if entry.value().config().credential_ref == credential_ref {
                self.resume(entry.key());
            }
        }
    }

    pub fn health_check(&self) -> HealthReport {
        let mut pipelines: Vec<PipelineHealth> = self
            .pipelines
            .iter()
            .map(|entry| {
                let pipeline = entry.value();
                let config = pipeline.config();
                PipelineHealth {
                    pipeline_id: config.pipeline_id.clone(),
                    route_id: config.route_id.clone(),
                    provider: config.provider.clone(),
                    model: config.model.clone(),
                    status: pipeline.status().as_str().to_string(),
                    healthy: pipeline.health(),
                }
            })
            .collect();
        pipelines.sort_by(|a, b| a.pipeline_id.cmp(&b.pipeline_id));
        HealthReport { healthy: pipelines.iter().all(|p| p.healthy), pipelines }
    }
}
