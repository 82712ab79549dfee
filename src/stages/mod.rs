//! Stage modules and the payload envelope that flows between them.
//!
//! [`StageModule`] is an enum that wraps a concrete stage chosen at assembly
//! time from a layer config. All pipeline code interacts with the same
//! capability — `forward`, `back`, `health`, `stop` — and every
//! stage-specific behaviour is fully encapsulated in the stage modules.
//! Stages hold only immutable configuration, so one instance serves any
//! number of concurrent requests.

pub mod compat;
pub mod protocol;
pub mod server;
pub mod sse;
pub mod transformer;

pub use compat::CompatStage;
pub use protocol::ProtocolStage;
pub use server::{HttpTransport, ServerStage, Transport};
pub use transformer::TransformerStage;

use std::{collections::BTreeMap, fmt, pin::Pin};

use bytes::Bytes;
use futures_util::Stream;
use serde_json::{json, Value};

use crate::error::PipelineError;
use crate::execution::RequestContext;

/// A `Send`-able, heap-allocated SSE byte stream.
///
/// Each item is a chunk of raw SSE data or an error; the stream terminates
/// when all data has been yielded.
pub type SseStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

/// Position tag of a stage within a pipeline. The order is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageTag {
    Transformer,
    Protocol,
    ServerCompatibility,
    Server,
}

impl StageTag {
    /// Forward-path order; the back path is the reverse.
    pub const ORDER: [StageTag; 4] = [
        StageTag::Transformer,
        StageTag::Protocol,
        StageTag::ServerCompatibility,
        StageTag::Server,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transformer => "transformer",
            Self::Protocol => "protocol",
            Self::ServerCompatibility => "server-compatibility",
            Self::Server => "server",
        }
    }
}

impl fmt::Display for StageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a [`Payload`]: buffered JSON on the ordinary path, a byte stream
/// once the Server stage has opened an SSE response.
pub enum PayloadBody {
    Json(Value),
    Stream(SseStream),
}

impl PayloadBody {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(v) => Some(v),
            Self::Stream(_) => None,
        }
    }
}

impl fmt::Debug for PayloadBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// The envelope passed between stages. Stages own the payload for the
/// duration of their call and hand back a (possibly rebuilt) envelope;
/// nothing else is shared between stages within a request.
#[derive(Debug)]
pub struct Payload {
    pub body: PayloadBody,
    /// Transport headers, attached by the Protocol stage and adjusted by
    /// Server-Compatibility.
    pub headers: BTreeMap<String, String>,
    /// Fully-joined request URL, attached by the Protocol stage.
    pub url: Option<String>,
    pub stream: bool,
}

impl Payload {
    pub fn json(body: Value) -> Self {
        Self { body: PayloadBody::Json(body), headers: BTreeMap::new(), url: None, stream: false }
    }

    /// Snapshot for execution records. Streams are represented by a marker —
    /// their bytes belong to the client, not the record.
    pub fn snapshot(&self) -> Value {
        match &self.body {
            PayloadBody::Json(v) => v.clone(),
            PayloadBody::Stream(_) => json!({ "type": "sse_stream" }),
        }
    }
}

/// A preconfigured bidirectional processor — one of the four pipeline stages.
///
/// Enum dispatch over concrete stage types: the correct variant is selected
/// once at assembly, and configuration is immutable afterwards.
pub enum StageModule {
    Transformer(TransformerStage),
    Protocol(ProtocolStage),
    Compat(CompatStage),
    Server(ServerStage),
}

impl StageModule {
    pub fn tag(&self) -> StageTag {
        match self {
            Self::Transformer(_) => StageTag::Transformer,
            Self::Protocol(_) => StageTag::Protocol,
            Self::Compat(_) => StageTag::ServerCompatibility,
            Self::Server(_) => StageTag::Server,
        }
    }

    /// Request-direction processing. Only the Server stage suspends.
    pub async fn forward(
        &self,
        payload: Payload,
        ctx: &RequestContext,
    ) -> Result<Payload, PipelineError> {
        match self {
            Self::Transformer(s) => s.forward(payload),
            Self::Protocol(s) => s.forward(payload),
            Self::Compat(s) => s.forward(payload),
            Self::Server(s) => s.forward(payload, ctx).await,
        }
    }

    /// Response-direction processing.
    pub async fn back(
        &self,
        payload: Payload,
        _ctx: &RequestContext,
    ) -> Result<Payload, PipelineError> {
        match self {
            Self::Transformer(s) => s.back(payload),
            Self::Protocol(s) => s.back(payload),
            Self::Compat(s) => s.back(payload),
            Self::Server(s) => s.back(payload),
        }
    }

    pub fn health(&self) -> bool {
        match self {
            Self::Transformer(s) => s.health(),
            Self::Protocol(s) => s.health(),
            Self::Compat(s) => s.health(),
            Self::Server(s) => s.health(),
        }
    }

    /// Assembly-time warm-up hook. Pipelines only reach `runtime` when every
    /// stage starts cleanly.
    pub fn start(&self) -> anyhow::Result<()> {
        match self {
            Self::Server(s) => s.start(),
            _ => Ok(()),
        }
    }

    /// Release background resources. Stages hold no per-request state, so
    /// this is best-effort and infallible.
    pub fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_is_fixed() {
        let tags: Vec<&str> = StageTag::ORDER.iter().map(StageTag::as_str).collect();
        assert_eq!(tags, ["transformer", "protocol", "server-compatibility", "server"]);
    }

    #[test]
    fn tag_serialises_kebab_case() {
        assert_eq!(
            serde_json::to_value(StageTag::ServerCompatibility).unwrap(),
            serde_json::json!("server-compatibility")
        );
    }

    #[test]
    fn payload_snapshot_masks_streams() {
        let payload = Payload {
            body: PayloadBody::Stream(Box::pin(futures_util::stream::empty())),
            headers: BTreeMap::new(),
            url: None,
            stream: true,
        };
        assert_eq!(payload.snapshot(), json!({ "type": "sse_stream" }));
    }
}
