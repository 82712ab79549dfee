//! Runtime error taxonomy for the request pipeline.
//!
//! Every failure that can reach a caller is a [`PipelineError`] variant with a
//! stable `kind`, the component that produced it, and a context object for the
//! execution record. Startup-time families ([`crate::config::ConfigError`],
//! [`crate::compiler::RouterConfigError`], [`crate::assembler::AssemblyError`])
//! live next to the components that raise them; they are fatal and never cross
//! the HTTP boundary.
//!
//! The HTTP mapping is fixed:
//!
//! | Error | Status |
//! |---|---|
//! | `Auth` | 401 |
//! | `PipelineNotFound`, `PipelineUnavailable` | 503 |
//! | `Validation` | 502 |
//! | `Timeout` | 504 |
//! | everything else | 500 |
//!
//! Responses are Anthropic-shaped error bodies; credential material never
//! appears in them.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::stages::StageTag;

/// A runtime failure inside the pipeline subsystem.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline `{0}` not found")]
    PipelineNotFound(String),

    #[error("pipeline `{id}` is {status}: {reason}")]
    PipelineUnavailable {
        id: String,
        status: String,
        reason: String,
    },

    /// A stage produced (or received) a payload violating its output contract.
    /// Never retried by the runtime.
    #[error("{stage} stage produced an invalid payload: {message}")]
    Validation { stage: StageTag, message: String },

    #[error("transform failed: {0}")]
    Transform(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("compatibility error: {0}")]
    Compatibility(String),

    /// Network-level failure or retriable upstream status, already retried by
    /// the Server stage up to its configured budget.
    #[error("transport failure after {attempts} attempt(s): {message}")]
    Transport { message: String, attempts: u32 },

    /// Upstream rejected the request as unauthenticated/unauthorized.
    /// The Server stage has already notified the CredentialManager.
    #[error("upstream rejected credential `{credential_ref}` (HTTP {status})")]
    Auth { status: u16, credential_ref: String },

    /// Operator action required: the credential cannot be refreshed.
    #[error("credential `{credential_ref}` for provider `{provider}` requires re-authentication")]
    AuthRecreateRequired {
        credential_ref: String,
        provider: String,
        oauth_url: Option<String>,
    },

    #[error("request deadline exceeded")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Stable machine-readable kind, used in execution records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PipelineNotFound(_) => "pipeline_not_found",
            Self::PipelineUnavailable { .. } => "pipeline_unavailable",
            Self::Validation { .. } => "validation_error",
            Self::Transform(_) => "transform_error",
            Self::Protocol(_) => "protocol_error",
            Self::Compatibility(_) => "compatibility_error",
            Self::Transport { .. } => "transport_error",
            Self::Auth { .. } => "auth_error",
            Self::AuthRecreateRequired { .. } => "auth_recreate_required",
            Self::Timeout => "timeout_error",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal_error",
        }
    }

    /// The component that raised the error.
    pub fn source_component(&self) -> &'static str {
        match self {
            Self::PipelineNotFound(_) | Self::PipelineUnavailable { .. } => "pipeline-manager",
            Self::Validation { stage, .. } => stage.as_str(),
            Self::Transform(_) => "transformer",
            Self::Protocol(_) => "protocol",
            Self::Compatibility(_) => "server-compatibility",
            Self::Transport { .. } | Self::Auth { .. } => "server",
            Self::AuthRecreateRequired { .. } => "credential-manager",
            Self::Timeout | Self::Cancelled | Self::Internal(_) => "pipeline-runtime",
        }
    }

    /// Structured context for the execution record. Never contains secrets.
    pub fn context(&self) -> Value {
        match self {
            Self::PipelineNotFound(id) => json!({ "pipeline_id": id }),
            Self::PipelineUnavailable { id, status, .. } => {
                json!({ "pipeline_id": id, "status": status })
            }
            Self::Validation { stage, .. } => json!({ "stage": stage.as_str() }),
            Self::Transport { attempts, .. } => json!({ "attempts": attempts }),
            Self::Auth { status, credential_ref } => {
                json!({ "status": status, "credential_ref": credential_ref })
            }
            Self::AuthRecreateRequired { credential_ref, provider, oauth_url } => json!({
                "credential_ref": credential_ref,
                "provider": provider,
                "oauth_url": oauth_url,
            }),
            _ => json!({}),
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Auth { .. } => StatusCode::UNAUTHORIZED,
            Self::PipelineNotFound(_) | Self::PipelineUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Validation { .. } => StatusCode::BAD_GATEWAY,
            Self::Transport { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Anthropic wire error type for the response body.
    fn wire_type(&self) -> &'static str {
        match self {
            Self::Auth { .. } | Self::AuthRecreateRequired { .. } => "authentication_error",
            Self::PipelineNotFound(_) | Self::PipelineUnavailable { .. } => "overloaded_error",
            _ => "api_error",
        }
    }
}

/// Errors are returned to clients as Anthropic-shaped bodies:
/// `{"type": "error", "error": {"type": …, "message": …}}`.
impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        tracing::warn!(kind = self.kind(), source = self.source_component(), error = %self, "request failed");
        let body = json!({
            "type": "error",
            "error": { "type": self.wire_type(), "message": self.to_string() },
        });
        (self.http_status(), Json(body)).into_response()
    }
}
