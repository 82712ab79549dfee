//! Router compiler — expands a [`RoutingTable`] into pipeline configs.
//!
//! One [`PipelineConfig`] is emitted per route. Each carries the fully
//! resolved recipe for a single request path: provider, model, endpoint,
//! credential ref, token budget, and the four layer configs the assembler
//! will realise. The compiler re-checks referential integrity even though the
//! config compiler already validated it — an emitted pipeline must always be
//! realisable.

use std::collections::HashSet;

use serde_json::{json, Value};

use crate::config::RoutingTable;
use crate::stages::StageTag;

/// Route names with routing semantics attached; anything else still compiles
/// but is only reachable through an explicit route hint.
const WELL_KNOWN_ROUTES: &[&str] = &["default", "longContext", "background", "think", "webSearch"];

/// Default per-request timeout handed to the server layer.
const SERVER_TIMEOUT_MS: u64 = 60_000;
/// Default retry budget for the server layer.
const SERVER_MAX_RETRIES: u32 = 3;

#[derive(Debug, thiserror::Error)]
#[error("router config error at `{field}`: {message}")]
pub struct RouterConfigError {
    pub field: String,
    pub message: String,
}

/// Configuration for one stage of a pipeline.
#[derive(Debug, Clone)]
pub struct LayerConfig {
    pub stage: StageTag,
    /// Variant tag used for the module-registry lookup. Never empty.
    pub variant: String,
    pub options: Value,
}

/// Fully-resolved recipe for one request path.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub pipeline_id: String,
    pub route_id: String,
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    pub credential_ref: String,
    pub max_tokens: u64,
    /// Exactly four layers, in pipeline order.
    pub layers: Vec<LayerConfig>,
}

#[derive(Debug)]
pub struct CompileOutput {
    pub pipelines: Vec<PipelineConfig>,
    pub warnings: Vec<String>,
}

/// Expand the routing table into the flat pipeline-config list.
pub fn compile(table: &RoutingTable) -> Result<CompileOutput, RouterConfigError> {
    let mut pipelines = Vec::with_capacity(table.routes.len());
    let mut warnings = table.warnings.clone();
    let mut seen_ids = HashSet::new();

    for (route, target) in &table.routes {
        let field = format!("router.{route}");

        let provider = table.provider(&target.provider).ok_or_else(|| RouterConfigError {
            field: field.clone(),
            message: format!("route references unknown provider `{}`", target.provider),
        })?;
        let model = provider.model(&target.model).ok_or_else(|| RouterConfigError {
            field: field.clone(),
            message: format!(
                "route references model `{}` which provider `{}` does not declare",
                target.model, provider.name
            ),
        })?;

        let pipeline_id = format!("{}_{}_{}", provider.name, model.name, route);
        if !seen_ids.insert(pipeline_id.clone()) {
            return Err(RouterConfigError {
                field,
                message: format!("duplicate pipeline id `{pipeline_id}`"),
            });
        }

        if !WELL_KNOWN_ROUTES.contains(&route.as_str()) {
            warnings.push(format!(
                "route `{route}` is not a recognised routing decision — reachable only via route hint"
            ));
        }

        let credential_ref = provider.credential_ref();
        let layers = vec![
            LayerConfig {
                stage: StageTag::Transformer,
                variant: "anthropic-to-openai".into(),
                options: json!({
                    "direction": "anthropic-to-openai",
                    "preserveToolCalls": true,
                    "mapSystemMessage": true,
                    "defaultMaxTokens": model.max_tokens,
                }),
            },
            LayerConfig {
                stage: StageTag::Protocol,
                variant: "openai".into(),
                options: json!({
                    "endpoint": provider.base_url,
                    "path": "/chat/completions",
                    "streamDefault": true,
                    "credentialRef": credential_ref,
                }),
            },
            LayerConfig {
                stage: StageTag::ServerCompatibility,
                variant: provider.compat_profile.clone(),
                options: json!({
                    "credentialRef": credential_ref,
                    "profileOptions": provider.compat_options,
                }),
            },
            LayerConfig {
                stage: StageTag::Server,
                variant: "http".into(),
                options: json!({
                    "endpoint": provider.base_url,
                    "credentialRef": credential_ref,
                    "provider": provider.name,
                    "timeoutMs": SERVER_TIMEOUT_MS,
                    "maxRetries": SERVER_MAX_RETRIES,
                }),
            },
        ];

        // Layer tags have gone missing in past refactors; make the invariant
        // impossible to miss.
        if let Some(layer) = layers.iter().find(|l| l.variant.is_empty()) {
            return Err(RouterConfigError {
                field,
                message: format!("layer `{}` compiled with an empty variant tag", layer.stage),
            });
        }

        pipelines.push(PipelineConfig {
            pipeline_id,
            route_id: route.clone(),
            provider: provider.name.clone(),
            model: model.name.clone(),
            endpoint: provider.base_url.clone(),
            credential_ref,
            max_tokens: model.max_tokens,
            layers,
        });
    }

    Ok(CompileOutput { pipelines, warnings })
}
