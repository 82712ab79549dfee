//! Protocol stage — the transport envelope around an OpenAI-shaped payload.
//!
//! Forward attaches the joined endpoint URL, the fixed header set, and the
//! stream echo; it also re-validates the transformer's output contract before
//! anything leaves the process. No business logic lives here — provider
//! quirks belong to the server-compatibility stage.

use std::sync::Arc;

use serde_json::json;

use crate::compiler::LayerConfig;
use crate::credentials::CredentialManager;
use crate::error::PipelineError;
use crate::stages::{Payload, PayloadBody, StageTag};

const USER_AGENT: &str = concat!("llm-relay/", env!("CARGO_PKG_VERSION"));

/// Preconfigured envelope writer for the OpenAI chat-completions protocol.
pub struct ProtocolStage {
    endpoint: String,
    path: String,
    stream_default: bool,
    credential_ref: String,
    credentials: Arc<CredentialManager>,
}

impl ProtocolStage {
    pub fn from_config(
        layer: &LayerConfig,
        credentials: Arc<CredentialManager>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            layer.variant == "openai",
            "unsupported protocol variant `{}`",
            layer.variant
        );
        let endpoint = layer.options["endpoint"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("protocol layer needs an `endpoint`"))?
            .trim_end_matches('/')
            .to_string();
        let credential_ref = layer.options["credentialRef"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("protocol layer needs a `credentialRef`"))?
            .to_string();
        Ok(Self {
            endpoint,
            path: layer.options["path"].as_str().unwrap_or("/chat/completions").to_string(),
            stream_default: layer.options["streamDefault"].as_bool().unwrap_or(true),
            credential_ref,
            credentials,
        })
    }

    pub fn forward(&self, mut payload: Payload) -> Result<Payload, PipelineError> {
        let body = match &mut payload.body {
            PayloadBody::Json(body) => body,
            PayloadBody::Stream(_) => {
                return Err(PipelineError::Protocol(
                    "forward path received a stream before dispatch".into(),
                ));
            }
        };

        // Re-validate the transformer's output contract at the seam.
        super::transformer::validate_openai_request(body).map_err(|message| {
            PipelineError::Validation {
                stage: StageTag::Protocol,
                message: format!("not a valid chat completions request: {message}"),
            }
        })?;

        if body.get("stream").is_none() {
            body["stream"] = json!(self.stream_default);
        }
        payload.stream = body["stream"].as_bool().unwrap_or(false);

        let token = self.credentials.bearer(&self.credential_ref).ok_or_else(|| {
            PipelineError::Protocol(format!(
                "no credential material for `{}`",
                self.credential_ref
            ))
        })?;

        payload.url = Some(format!("{}{}", self.endpoint, self.path));
        payload.headers.insert("Content-Type".into(), "application/json".into());
        payload.headers.insert("Authorization".into(), format!("Bearer {token}"));
        payload.headers.insert("User-Agent".into(), USER_AGENT.into());

        Ok(payload)
    }

    /// Back-path validation of the upstream envelope. Buffered responses must
    /// carry a `choices` list; the transformer enforces the Anthropic-side
    /// contract once it has raised the payload. Streams pass through — their
    /// framing is checked event-by-event during translation.
    pub fn back(&self, payload: Payload) -> Result<Payload, PipelineError> {
        if let PayloadBody::Json(body) = &payload.body {
            if !body.is_object() || !body["choices"].is_array() {
                return Err(PipelineError::Validation {
                    stage: StageTag::Protocol,
                    message: "upstream response has no `choices` list".into(),
                });
            }
        }
        Ok(payload)
    }

    pub fn health(&self) -> bool {
        self.credentials.bearer(&self.credential_ref).is_some()
    }
}
