//! Server stage — HTTP dispatch through the Transport capability.
//!
//! The only stage that performs I/O, and the only component in the system
//! that retries. 4xx statuses are never retried; 5xx and transport-level
//! failures are, up to the configured budget, with exponential backoff and
//! full jitter. 401/403 surface as auth errors and notify the
//! CredentialManager out-of-band.
//!
//! Credential material is re-read at the start of every attempt, so a refresh
//! that lands mid-request applies to the next retry.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::Context as _;
use futures_util::{future::BoxFuture, StreamExt as _};
use serde_json::Value;
use tracing::{debug, warn};

use crate::compiler::LayerConfig;
use crate::credentials::{CredentialManager, CredentialState};
use crate::error::PipelineError;
use crate::execution::RequestContext;
use crate::stages::{Payload, PayloadBody, SseStream, StageTag};

/// First-retry backoff.
const BACKOFF_BASE_MS: u64 = 200;
/// Backoff doubles per attempt…
const BACKOFF_FACTOR: u64 = 2;
/// …capped here.
const BACKOFF_CAP_MS: u64 = 5_000;

/// A request fully prepared by the earlier stages: joined URL, final headers,
/// OpenAI-shaped body.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub timeout: Duration,
    pub stream: bool,
}

/// What came back from one transport attempt. Streaming replies are only
/// produced for 2xx; error statuses arrive buffered so the retry loop can
/// inspect them uniformly.
pub enum TransportReply {
    Buffered { status: u16, body: String },
    Stream { status: u16, stream: SseStream },
}

/// Capability for performing prepared requests. Object-safe so tests and
/// alternative dispatchers can stand in for real HTTP.
pub trait Transport: Send + Sync {
    fn send(&self, request: PreparedRequest) -> BoxFuture<'_, anyhow::Result<TransportReply>>;
}

/// Production transport over reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: PreparedRequest) -> BoxFuture<'_, anyhow::Result<TransportReply>> {
        Box::pin(async move {
            let mut builder = self.client.post(&request.url).json(&request.body);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if !request.stream {
                // Streaming bodies arrive incrementally; a whole-request
                // timeout would cut them off.
                builder = builder.timeout(request.timeout);
            }

            let response = builder
                .send()
                .await
                .with_context(|| format!("POST {}", request.url))?;
            let status = response.status().as_u16();

            if request.stream && response.status().is_success() {
                let stream = response.bytes_stream().map(|r| r.map_err(anyhow::Error::from));
                Ok(TransportReply::Stream { status, stream: Box::pin(stream) })
            } else {
                let body = response.text().await.context("reading response body")?;
                Ok(TransportReply::Buffered { status, body })
            }
        })
    }
}

/// HTTP dispatcher for one pipeline.
pub struct ServerStage {
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialManager>,
    credential_ref: String,
    provider: String,
    timeout: Duration,
    max_retries: u32,
}

impl ServerStage {
    pub fn from_config(
        layer: &LayerConfig,
        credentials: Arc<CredentialManager>,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            layer.variant == "http",
            "unsupported server variant `{}`",
            layer.variant
        );
        Ok(Self {
            transport,
            credentials,
            credential_ref: layer.options["credentialRef"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("server layer needs a `credentialRef`"))?
                .to_string(),
            provider: layer.options["provider"].as_str().unwrap_or_default().to_string(),
            timeout: Duration::from_millis(layer.options["timeoutMs"].as_u64().unwrap_or(60_000)),
            max_retries: layer.options["maxRetries"].as_u64().unwrap_or(3) as u32,
        })
    }

    pub async fn forward(
        &self,
        mut payload: Payload,
        ctx: &RequestContext,
    ) -> Result<Payload, PipelineError> {
        let url = payload.url.clone().ok_or_else(|| {
            PipelineError::Internal("server stage reached without a prepared URL".into())
        })?;
        let body = match &payload.body {
            PayloadBody::Json(body) => body.clone(),
            PayloadBody::Stream(_) => {
                return Err(PipelineError::Internal(
                    "server stage reached with a stream body".into(),
                ));
            }
        };

        let mut attempt: u32 = 0;
        let mut last_error = String::new();

        loop {
            attempt += 1;
            if ctx.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let Some(remaining) = ctx.remaining() else {
                return Err(PipelineError::Timeout);
            };
            let attempt_timeout = remaining.min(self.timeout);

            // Fresh material every attempt — a mid-request refresh applies
            // from the next retry onward.
            let mut headers = payload.headers.clone();
            if headers.contains_key("Authorization") {
                if let Some(token) = self.credentials.bearer(&self.credential_ref) {
                    headers.insert("Authorization".into(), format!("Bearer {token}"));
                }
            }

            let prepared = PreparedRequest {
                url: url.clone(),
                headers,
                body: body.clone(),
                timeout: attempt_timeout,
                stream: payload.stream,
            };

            debug!(provider = %self.provider, %url, attempt, "dispatching upstream");

            let reply = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(PipelineError::Cancelled),
                reply = tokio::time::timeout(attempt_timeout, self.transport.send(prepared)) => reply,
            };

            match reply {
                Err(_) => {
                    last_error = format!("attempt timed out after {attempt_timeout:?}");
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                }
                Ok(Ok(TransportReply::Stream { status: _, stream })) => {
                    payload.body = PayloadBody::Stream(stream);
                    return Ok(payload);
                }
                Ok(Ok(TransportReply::Buffered { status, body: text })) => match status {
                    200..=299 => {
                        let parsed: Value = serde_json::from_str(&text).map_err(|e| {
                            PipelineError::Validation {
                                stage: StageTag::Server,
                                message: format!("upstream returned unparseable JSON: {e}"),
                            }
                        })?;
                        payload.body = PayloadBody::Json(parsed);
                        return Ok(payload);
                    }
                    401 | 403 => {
                        warn!(
                            provider = %self.provider,
                            credential_ref = %self.credential_ref,
                            status,
                            "upstream rejected credentials"
                        );
                        self.credentials.refresh_auth(&self.credential_ref);
                        return Err(PipelineError::Auth {
                            status,
                            credential_ref: self.credential_ref.clone(),
                        });
                    }
                    400..=499 => {
                        return Err(PipelineError::Transport {
                            message: format!("upstream returned HTTP {status}: {}", truncate(&text, 200)),
                            attempts: attempt,
                        });
                    }
                    _ => {
                        last_error =
                            format!("upstream returned HTTP {status}: {}", truncate(&text, 200));
                    }
                },
            }

            if attempt > self.max_retries {
                return Err(PipelineError::Transport { message: last_error, attempts: attempt });
            }

            let delay = backoff_delay(attempt);
            warn!(
                provider = %self.provider,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "upstream attempt failed — retrying"
            );
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// The response body was already parsed on the forward path; nothing to do
    /// on the way back.
    pub fn back(&self, payload: Payload) -> Result<Payload, PipelineError> {
        Ok(payload)
    }

    pub fn health(&self) -> bool {
        self.credentials.state(&self.credential_ref) != Some(CredentialState::Invalid)
    }

    pub fn start(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.credentials.bearer(&self.credential_ref).is_some(),
            "credential `{}` is not loaded",
            self.credential_ref
        );
        Ok(())
    }
}

/// Upper bound of the backoff window for a given (1-based) attempt.
fn backoff_ceiling_ms(attempt: u32) -> u64 {
    BACKOFF_BASE_MS
        .saturating_mul(BACKOFF_FACTOR.saturating_pow(attempt.saturating_sub(1)))
        .min(BACKOFF_CAP_MS)
}

/// Full jitter: a uniform draw from zero to the exponential ceiling.
fn backoff_delay(attempt: u32) -> Duration {
    use rand::Rng as _;
    let ceiling = backoff_ceiling_ms(attempt);
    Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt as _;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn stage_for(server_uri: &str, token: &str, max_retries: u32) -> ServerStage {
        let layer = LayerConfig {
            stage: StageTag::Server,
            variant: "http".into(),
            options: json!({
                "endpoint": server_uri,
                "credentialRef": "cred",
                "provider": "mock",
                "timeoutMs": 5_000,
                "maxRetries": max_retries,
            }),
        };
        ServerStage::from_config(
            &layer,
            CredentialManager::test_fixture(&[("cred", token)]),
            Arc::new(HttpTransport::new()),
        )
        .unwrap()
    }

    fn prepared_payload(server_uri: &str, stream: bool) -> Payload {
        let mut payload = Payload::json(json!({
            "model": "m", "messages": [], "stream": stream,
        }));
        payload.url = Some(format!("{server_uri}/chat/completions"));
        payload.headers.insert("Content-Type".into(), "application/json".into());
        payload.headers.insert("Authorization".into(), "Bearer stale".into());
        payload.stream = stream;
        payload
    }

    fn ctx() -> RequestContext {
        RequestContext::new("req-1", Duration::from_secs(30), CancellationToken::new())
    }

    // -----------------------------------------------------------------------
    // Success path
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn returns_parsed_body_on_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "hi" } }]
            })))
            .mount(&server)
            .await;

        let stage = stage_for(&server.uri(), "sk-1", 3);
        let out = stage.forward(prepared_payload(&server.uri(), false), &ctx()).await.unwrap();
        assert!(out.body.as_json().unwrap()["choices"].is_array());
    }

    #[tokio::test]
    async fn refreshes_authorization_header_per_attempt() {
        let server = MockServer::start().await;
        // The header the stage sends must carry the manager's current token,
        // not the one the protocol stage attached earlier.
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-current"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .expect(1)
            .mount(&server)
            .await;

        let stage = stage_for(&server.uri(), "sk-current", 0);
        let result = stage.forward(prepared_payload(&server.uri(), false), &ctx()).await;
        assert!(result.is_ok(), "got: {result:?}");
    }

    // -----------------------------------------------------------------------
    // Retry behaviour
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn retries_5xx_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;

        let stage = stage_for(&server.uri(), "sk-1", 3);
        let out = stage.forward(prepared_payload(&server.uri(), false), &ctx()).await;
        assert!(out.is_ok(), "expected success after retries, got: {out:?}");
    }

    #[tokio::test]
    async fn does_not_retry_4xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&server)
            .await;

        let stage = stage_for(&server.uri(), "sk-1", 3);
        let err = stage
            .forward(prepared_payload(&server.uri(), false), &ctx())
            .await
            .unwrap_err();
        match err {
            PipelineError::Transport { attempts, ref message } => {
                assert_eq!(attempts, 1, "4xx must not be retried");
                assert!(message.contains("400"));
            }
            other => panic!("expected Transport, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(502))
            .expect(2)
            .mount(&server)
            .await;

        let stage = stage_for(&server.uri(), "sk-1", 1);
        let err = stage
            .forward(prepared_payload(&server.uri(), false), &ctx())
            .await
            .unwrap_err();
        match err {
            PipelineError::Transport { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected Transport, got {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Auth failures
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn unauthorized_surfaces_auth_error_and_notifies_manager() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let credentials = CredentialManager::test_fixture(&[("cred", "sk-dead")]);
        let layer = LayerConfig {
            stage: StageTag::Server,
            variant: "http".into(),
            options: json!({
                "credentialRef": "cred", "provider": "mock",
                "timeoutMs": 5_000, "maxRetries": 3,
            }),
        };
        let stage = ServerStage::from_config(
            &layer,
            Arc::clone(&credentials),
            Arc::new(HttpTransport::new()),
        )
        .unwrap();

        let err = stage
            .forward(prepared_payload(&server.uri(), false), &ctx())
            .await
            .unwrap_err();
        match err {
            PipelineError::Auth { status, ref credential_ref } => {
                assert_eq!(status, 401);
                assert_eq!(credential_ref, "cred");
            }
            other => panic!("expected Auth, got {other:?}"),
        }
        // The notification flipped the credential out of its steady state.
        assert_ne!(credentials.state("cred"), Some(CredentialState::Valid));
    }

    // -----------------------------------------------------------------------
    // Contract violations & bad inputs
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn unparseable_2xx_body_is_a_validation_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string("definitely not json"))
            .mount(&server)
            .await;

        let stage = stage_for(&server.uri(), "sk-1", 3);
        let err = stage
            .forward(prepared_payload(&server.uri(), false), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn missing_url_is_an_internal_error() {
        let stage = stage_for("http://localhost:9", "sk-1", 0);
        let payload = Payload::json(json!({ "model": "m", "messages": [] }));
        let err = stage.forward(payload, &ctx()).await.unwrap_err();
        assert_eq!(err.kind(), "internal_error");
    }

    // -----------------------------------------------------------------------
    // Cancellation & deadline
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn cancelled_before_dispatch_returns_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = RequestContext::new("req-1", Duration::from_secs(30), token);

        let stage = stage_for("http://localhost:9", "sk-1", 3);
        let err = stage
            .forward(prepared_payload("http://localhost:9", false), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[tokio::test]
    async fn expired_deadline_returns_timeout() {
        let ctx = RequestContext::new("req-1", Duration::ZERO, CancellationToken::new());
        let stage = stage_for("http://localhost:9", "sk-1", 3);
        let err = stage
            .forward(prepared_payload("http://localhost:9", false), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Timeout));
    }

    // -----------------------------------------------------------------------
    // Streaming
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn streaming_2xx_returns_byte_stream() {
        let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(sse.as_bytes().to_vec(), "text/event-stream"),
            )
            .mount(&server)
            .await;

        let stage = stage_for(&server.uri(), "sk-1", 3);
        let out = stage.forward(prepared_payload(&server.uri(), true), &ctx()).await.unwrap();

        let PayloadBody::Stream(stream) = out.body else {
            panic!("expected a stream body");
        };
        let chunks: Vec<bytes::Bytes> =
            stream.map(|r| r.expect("stream chunk")).collect().await;
        let text: String = chunks.iter().map(|b| String::from_utf8_lossy(b).to_string()).collect();
        assert!(text.contains("[DONE]"));
    }

    #[tokio::test]
    async fn streaming_5xx_is_retried_like_buffered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(b"data: [DONE]\n\n".to_vec(), "text/event-stream"),
            )
            .mount(&server)
            .await;

        let stage = stage_for(&server.uri(), "sk-1", 3);
        let out = stage.forward(prepared_payload(&server.uri(), true), &ctx()).await.unwrap();
        assert!(matches!(out.body, PayloadBody::Stream(_)));
    }

    // -----------------------------------------------------------------------
    // Backoff
    // -----------------------------------------------------------------------

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_ceiling_ms(1), 200);
        assert_eq!(backoff_ceiling_ms(2), 400);
        assert_eq!(backoff_ceiling_ms(3), 800);
        assert_eq!(backoff_ceiling_ms(6), 5_000);
        assert_eq!(backoff_ceiling_ms(30), 5_000);
    }

    #[test]
    fn jitter_stays_within_ceiling() {
        for attempt in 1..=6 {
            for _ in 0..50 {
                let delay = backoff_delay(attempt);
                assert!(delay.as_millis() as u64 <= backoff_ceiling_ms(attempt));
            }
        }
    }
}
