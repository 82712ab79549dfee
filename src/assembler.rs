//! Pipeline assembler — realises pipeline configs into live pipelines.
//!
//! For each config the assembler resolves the four stage factories from the
//! module registry, builds the stages (the only point configuration flows
//! into a stage), runs their start hooks, and registers the pipeline with the
//! manager. Assembly is all-or-nothing per pipeline but partial across the
//! fleet: one bad pipeline never aborts the batch.

use std::{sync::Arc, time::Instant};

use tracing::{info, warn};

use crate::compiler::PipelineConfig;
use crate::pipeline::{Pipeline, PipelineManager, PipelineStatus};
use crate::registry::ModuleRegistry;
use crate::stages::{StageModule, StageTag};

#[derive(Debug, thiserror::Error)]
#[error("assembly of `{pipeline_id}` failed{}: {message}", stage.map(|s| format!(" at {s} stage")).unwrap_or_default())]
pub struct AssemblyError {
    pub pipeline_id: String,
    pub stage: Option<StageTag>,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AssemblyStats {
    pub total_pipelines: usize,
    pub assembled_pipelines: usize,
    pub failed_pipelines: usize,
    pub assembly_time_ms: u64,
}

#[derive(Debug)]
pub struct AssemblyResult {
    /// Ids of every registered pipeline, runnable or not.
    pub pipeline_ids: Vec<String>,
    pub stats: AssemblyStats,
    pub errors: Vec<AssemblyError>,
}

/// Assemble every config and register the results with the manager.
pub fn assemble(
    configs: &[PipelineConfig],
    registry: &ModuleRegistry,
    manager: &PipelineManager,
) -> AssemblyResult {
    let started = Instant::now();
    let mut pipeline_ids = Vec::with_capacity(configs.len());
    let mut errors = Vec::new();
    let mut assembled = 0usize;

    for config in configs {
        pipeline_ids.push(config.pipeline_id.clone());

        let pipeline = match build_stages(config, registry) {
            Ok(stages) => {
                let pipeline = Arc::new(Pipeline::new(config.clone(), stages));
                match pipeline.start_all() {
                    Ok(()) => {
                        pipeline.set_status(PipelineStatus::Runtime);
                        assembled += 1;
                        info!(
                            pipeline_id = %config.pipeline_id,
                            route = %config.route_id,
                            provider = %config.provider,
                            model = %config.model,
                            max_tokens = config.max_tokens,
                            "pipeline assembled"
                        );
                    }
                    Err((stage, e)) => {
                        let error = AssemblyError {
                            pipeline_id: config.pipeline_id.clone(),
                            stage: Some(stage),
                            message: format!("start hook failed: {e}"),
                        };
                        warn!(error = %error, "pipeline failed to start");
                        pipeline.set_status(PipelineStatus::Error { reason: error.message.clone() });
                        errors.push(error);
                    }
                }
                pipeline
            }
            Err(error) => {
                warn!(error = %error, "pipeline failed to assemble");
                // Register an inert shell so the fleet's health report shows
                // the failure; its status guard keeps requests out.
                let pipeline = Arc::new(Pipeline::new(config.clone(), Vec::new()));
                pipeline.set_status(PipelineStatus::Error { reason: error.message.clone() });
                errors.push(error);
                pipeline
            }
        };
        manager.add_pipeline(pipeline);
    }

    AssemblyResult {
        pipeline_ids,
        stats: AssemblyStats {
            total_pipelines: configs.len(),
            assembled_pipelines: assembled,
            failed_pipelines: configs.len() - assembled,
            assembly_time_ms: started.elapsed().as_millis() as u64,
        },
        errors,
    }
}

/// Build the four stages for one pipeline, in order. Any miss fails the whole
/// pipeline.
fn build_stages(
    config: &PipelineConfig,
    registry: &ModuleRegistry,
) -> Result<Vec<StageModule>, AssemblyError> {
    if config.layers.len() != StageTag::ORDER.len() {
        return Err(AssemblyError {
            pipeline_id: config.pipeline_id.clone(),
            stage: None,
            message: format!("expected 4 layers, found {}", config.layers.len()),
        });
    }

    let mut stages = Vec::with_capacity(4);
    for (layer, expected) in config.layers.iter().zip(StageTag::ORDER) {
        if layer.stage != expected {
            return Err(AssemblyError {
                pipeline_id: config.pipeline_id.clone(),
                stage: Some(layer.stage),
                message: format!("layer out of order: found {} where {expected} belongs", layer.stage),
            });
        }
        let factory = registry.get(layer.stage, &layer.variant).ok_or_else(|| AssemblyError {
            pipeline_id: config.pipeline_id.clone(),
            stage: Some(layer.stage),
            message: format!("no module registered for ({}, {})", layer.stage, layer.variant),
        })?;
        let stage = factory(layer).map_err(|e| AssemblyError {
            pipeline_id: config.pipeline_id.clone(),
            stage: Some(layer.stage),
            message: e.to_string(),
        })?;
        stages.push(stage);
    }
    Ok(stages)
}
