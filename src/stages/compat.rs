//! Server-compatibility stage — per-provider deviations.
//!
//! Quirks that cannot be expressed in the generic protocol envelope live
//! here, and only here; the transformer and protocol stages stay
//! provider-agnostic. Each variant is a small, named set of adjustments
//! applied after the envelope is built and before dispatch.

use std::{collections::BTreeMap, sync::Arc};

use serde_json::{json, Value};

use crate::compiler::LayerConfig;
use crate::credentials::CredentialManager;
use crate::error::PipelineError;
use crate::stages::{Payload, PayloadBody};

/// LM Studio rejects temperatures above 2.0.
const LMSTUDIO_TEMPERATURE_CAP: f64 = 2.0;
/// LM Studio rejects max_tokens above its context ceiling.
const LMSTUDIO_MAX_TOKENS_CAP: u64 = 32_768;
/// Keyless local LM Studio instances use this sentinel as their api_key.
const LMSTUDIO_KEYLESS_SENTINEL: &str = "lm-studio";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatVariant {
    OpenAiGeneric,
    LmStudio,
    Qwen,
    Iflow,
}

impl CompatVariant {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "openai-generic" => Some(Self::OpenAiGeneric),
            "lmstudio" => Some(Self::LmStudio),
            "qwen" => Some(Self::Qwen),
            "iflow" => Some(Self::Iflow),
            _ => None,
        }
    }
}

/// Provider-quirk adapter, selected by the provider's compat profile.
pub struct CompatStage {
    variant: CompatVariant,
    /// Requested model name → provider-side model name, from
    /// `serverCompatibility.options.modelAliases`.
    model_aliases: BTreeMap<String, String>,
    credential_ref: String,
    credentials: Arc<CredentialManager>,
}

impl CompatStage {
    pub fn from_config(
        layer: &LayerConfig,
        credentials: Arc<CredentialManager>,
    ) -> anyhow::Result<Self> {
        let variant = CompatVariant::from_tag(&layer.variant)
            .ok_or_else(|| anyhow::anyhow!("unknown compatibility profile `{}`", layer.variant))?;
        let credential_ref = layer.options["credentialRef"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("compatibility layer needs a `credentialRef`"))?
            .to_string();

        let mut model_aliases = BTreeMap::new();
        if let Some(aliases) = layer.options.pointer("/profileOptions/modelAliases").and_then(Value::as_object) {
            for (from, to) in aliases {
                if let Some(to) = to.as_str() {
                    model_aliases.insert(from.clone(), to.to_string());
                }
            }
        }

        Ok(Self { variant, model_aliases, credential_ref, credentials })
    }

    pub fn forward(&self, mut payload: Payload) -> Result<Payload, PipelineError> {
        let PayloadBody::Json(body) = &mut payload.body else {
            return Err(PipelineError::Compatibility(
                "forward path received a stream before dispatch".into(),
            ));
        };

        // Model aliasing is available to every profile when configured.
        if !self.model_aliases.is_empty() {
            if let Some(model) = body["model"].as_str() {
                if let Some(alias) = self.model_aliases.get(model) {
                    body["model"] = json!(alias);
                }
            }
        }

        match self.variant {
            CompatVariant::OpenAiGeneric => {}
            CompatVariant::LmStudio => {
                if let Some(t) = body["temperature"].as_f64() {
                    if t > LMSTUDIO_TEMPERATURE_CAP {
                        body["temperature"] = json!(LMSTUDIO_TEMPERATURE_CAP);
                    }
                }
                if let Some(max) = body["max_tokens"].as_u64() {
                    if max > LMSTUDIO_MAX_TOKENS_CAP {
                        body["max_tokens"] = json!(LMSTUDIO_MAX_TOKENS_CAP);
                    }
                }
                if self.credentials.bearer(&self.credential_ref).as_deref()
                    == Some(LMSTUDIO_KEYLESS_SENTINEL)
                {
                    payload.headers.remove("Authorization");
                }
            }
            CompatVariant::Qwen => {
                body["top_p"] = json!(0.9);
                payload.headers.insert("X-DashScope-Async".into(), "enable".into());
                self.rewrite_bearer(&mut payload.headers)?;
            }
            CompatVariant::Iflow => {
                self.rewrite_bearer(&mut payload.headers)?;
            }
        }

        Ok(payload)
    }

    /// Responses need no compatibility adjustments today; the stage exists on
    /// the back path so future quirks have a home.
    pub fn back(&self, payload: Payload) -> Result<Payload, PipelineError> {
        Ok(payload)
    }

    pub fn health(&self) -> bool {
        true
    }

    fn rewrite_bearer(&self, headers: &mut BTreeMap<String, String>) -> Result<(), PipelineError> {
        let token = self.credentials.bearer(&self.credential_ref).ok_or_else(|| {
            PipelineError::Compatibility(format!(
                "no credential material for `{}`",
                self.credential_ref
            ))
        })?;
        headers.insert("Authorization".into(), format!("Bearer {token}"));
        Ok(())
    }
}
