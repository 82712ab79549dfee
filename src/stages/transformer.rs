//! Transformer stage — Anthropic Messages ⇄ OpenAI Chat Completions.
//!
//! Forward lowers an Anthropic request into the OpenAI schema; back raises an
//! OpenAI response into the Anthropic schema. Tool definitions, tool-use and
//! tool-result turns survive both directions.
//!
//! # Schema differences handled here
//!
//! | Concern | Anthropic | OpenAI |
//! |---|---|---|
//! | System prompt | Top-level `system` (string or text parts) | First message with `role: "system"` |
//! | Tool definitions | `tools[].input_schema` | `tools[].function.parameters` |
//! | Assistant tool calls | `content[]` parts with `type: "tool_use"` | `message.tool_calls[]` |
//! | Tool results | `content[]` parts with `type: "tool_result"` | user message with a marker prefix |
//! | Stop reasons | `end_turn`, `max_tokens`, `tool_use` | `stop`, `length`, `tool_calls` |
//! | Usage | `input_tokens` / `output_tokens` | `prompt_tokens` / `completion_tokens` |
//!
//! On any validation failure the stage returns an error — never a synthesised
//! best-effort payload.

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::compiler::LayerConfig;
use crate::error::PipelineError;
use crate::stages::{Payload, PayloadBody, StageTag};

/// Marker prefix used when lowering `tool_result` parts into plain-text user
/// messages for providers that have no tool-result role.
const TOOL_RESULT_PREFIX: &str = "[Tool Result for ";

/// Preconfigured bidirectional format converter. Immutable after assembly.
#[derive(Debug, Clone)]
pub struct TransformerStage {
    preserve_tool_calls: bool,
    map_system_message: bool,
    default_max_tokens: u64,
}

impl TransformerStage {
    /// The only supported shape today; other directions are an assembly error.
    pub const DIRECTION: &'static str = "anthropic-to-openai";

    pub fn from_config(layer: &LayerConfig) -> anyhow::Result<Self> {
        let direction = layer.options["direction"].as_str().unwrap_or(Self::DIRECTION);
        anyhow::ensure!(
            direction == Self::DIRECTION,
            "unsupported transformer direction `{direction}`"
        );
        Ok(Self {
            preserve_tool_calls: layer.options["preserveToolCalls"].as_bool().unwrap_or(true),
            map_system_message: layer.options["mapSystemMessage"].as_bool().unwrap_or(true),
            default_max_tokens: layer.options["defaultMaxTokens"].as_u64().unwrap_or(8_192),
        })
    }

    /// Lower an Anthropic request into the OpenAI schema.
    pub fn forward(&self, mut payload: Payload) -> Result<Payload, PipelineError> {
        let request = payload.body.as_json().ok_or_else(|| PipelineError::Transform(
            "forward path expects a buffered JSON request".into(),
        ))?;

        let lowered = lower_request(request, self)?;
        validate_openai_request(&lowered).map_err(|message| PipelineError::Validation {
            stage: StageTag::Transformer,
            message,
        })?;

        payload.stream = lowered["stream"].as_bool().unwrap_or(false);
        payload.body = PayloadBody::Json(lowered);
        Ok(payload)
    }

    /// Raise an OpenAI response into the Anthropic schema. Streaming bodies are
    /// rewrapped so every upstream event is translated in arrival order.
    pub fn back(&self, mut payload: Payload) -> Result<Payload, PipelineError> {
        match payload.body {
            PayloadBody::Json(ref response) => {
                let raised = raise_response(response)?;
                validate_anthropic_response(&raised).map_err(|message| {
                    PipelineError::Validation { stage: StageTag::Transformer, message }
                })?;
                payload.body = PayloadBody::Json(raised);
                Ok(payload)
            }
            PayloadBody::Stream(upstream) => {
                payload.body = PayloadBody::Stream(super::sse::translate_stream(upstream));
                Ok(payload)
            }
        }
    }

    pub fn health(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Request lowering (Anthropic → OpenAI)
// ---------------------------------------------------------------------------

pub(crate) fn lower_request(
    request: &Value,
    stage: &TransformerStage,
) -> Result<Value, PipelineError> {
    let model = request["model"]
        .as_str()
        .ok_or_else(|| PipelineError::Transform("`model` field is required".into()))?;

    let raw_messages = request["messages"]
        .as_array()
        .ok_or_else(|| PipelineError::Transform("`messages` array is required".into()))?;

    let mut messages: Vec<Value> = Vec::with_capacity(raw_messages.len() + 1);

    // Anthropic carries system content as a top-level field; OpenAI wants it as
    // the leading message.
    if stage.map_system_message {
        if let Some(system) = system_text(&request["system"])? {
            messages.push(json!({ "role": "system", "content": system }));
        }
    }

    for message in raw_messages {
        let role = message["role"].as_str().ok_or_else(|| {
            PipelineError::Transform("message without a `role` field".into())
        })?;
        lower_message(role, &message["content"], stage, &mut messages)?;
    }

    let mut out = Map::new();
    out.insert("model".into(), json!(model));
    out.insert("messages".into(), Value::Array(messages));
    out.insert(
        "max_tokens".into(),
        json!(request["max_tokens"].as_u64().unwrap_or(stage.default_max_tokens)),
    );

    for key in ["temperature", "top_p", "top_k"] {
        if let Some(v) = request.get(key) {
            if !v.is_null() {
                out.insert(key.into(), v.clone());
            }
        }
    }
    out.insert("stream".into(), json!(request["stream"].as_bool().unwrap_or(false)));
    if let Some(stop) = request.get("stop_sequences") {
        if !stop.is_null() {
            out.insert("stop".into(), stop.clone());
        }
    }

    if let Some(tools) = request["tools"].as_array() {
        let lowered: Vec<Value> = tools.iter().filter_map(lower_tool).collect();
        if !lowered.is_empty() {
            out.insert("tools".into(), Value::Array(lowered));
        }
    }
    if let Some(choice) = lower_tool_choice(&request["tool_choice"]) {
        out.insert("tool_choice".into(), choice);
    }

    Ok(Value::Object(out))
}

/// `system` may be a plain string or a list of text parts; parts are joined
/// with a single space.
fn system_text(system: &Value) -> Result<Option<String>, PipelineError> {
    match system {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter(|p| p["type"] == "text")
                .filter_map(|p| p["text"].as_str())
                .collect();
            if texts.is_empty() {
                Ok(None)
            } else {
                Ok(Some(texts.join(" ")))
            }
        }
        other => Err(PipelineError::Transform(format!(
            "`system` must be a string or a list of text parts, got {other}"
        ))),
    }
}

/// Lower one Anthropic message. A single message can expand into several
/// OpenAI messages because `tool_result` parts become standalone user turns;
/// part order is preserved across the expansion.
fn lower_message(
    role: &str,
    content: &Value,
    stage: &TransformerStage,
    out: &mut Vec<Value>,
) -> Result<(), PipelineError> {
    let parts = match content {
        Value::String(text) => {
            out.push(json!({ "role": role, "content": text }));
            return Ok(());
        }
        Value::Array(parts) => parts,
        other => {
            return Err(PipelineError::Transform(format!(
                "message content must be a string or a list of parts, got {other}"
            )));
        }
    };

    let mut text_chunks: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    let flush = |text_chunks: &mut Vec<String>, tool_calls: &mut Vec<Value>, out: &mut Vec<Value>| {
        if text_chunks.is_empty() && tool_calls.is_empty() {
            return;
        }
        let content = if text_chunks.is_empty() {
            Value::Null
        } else {
            Value::String(text_chunks.join(" "))
        };
        let mut message = json!({ "role": role, "content": content });
        if !tool_calls.is_empty() {
            message["tool_calls"] = Value::Array(std::mem::take(tool_calls));
        }
        text_chunks.clear();
        out.push(message);
    };

    for part in parts {
        match part["type"].as_str() {
            Some("text") => {
                if let Some(text) = part["text"].as_str() {
                    text_chunks.push(text.to_string());
                }
            }
            Some("tool_use") => {
                if !stage.preserve_tool_calls {
                    warn!("dropping tool_use part (tool calls disabled for this pipeline)");
                    continue;
                }
                let name = part["name"].as_str().ok_or_else(|| {
                    PipelineError::Transform("tool_use part without a `name`".into())
                })?;
                let id = part["id"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(synthesise_call_id);
                let arguments = serde_json::to_string(&part["input"])
                    .map_err(|e| PipelineError::Transform(e.to_string()))?;
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": { "name": name, "arguments": arguments },
                }));
            }
            Some("tool_result") => {
                // Standalone user turn; flush anything buffered first so part
                // order survives.
                flush(&mut text_chunks, &mut tool_calls, out);
                let id = part["tool_use_id"].as_str().unwrap_or("unknown");
                let text = tool_result_text(&part["content"]);
                out.push(json!({
                    "role": "user",
                    "content": format!("{TOOL_RESULT_PREFIX}{id}]: {text}"),
                }));
            }
            _ => {
                // Unknown/structured part: keep it visible rather than dropping it.
                text_chunks.push(format!("[Object: {part}]"));
            }
        }
    }

    flush(&mut text_chunks, &mut tool_calls, out);
    Ok(())
}

/// String form of a tool_result `content`: text parts concatenated, anything
/// else JSON-serialised.
fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(|p| match p["type"].as_str() {
                Some("text") => p["text"].as_str().unwrap_or_default().to_string(),
                _ => p.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" "),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Tools missing a `name` are dropped with a warning rather than failing the
/// whole request.
fn lower_tool(tool: &Value) -> Option<Value> {
    let Some(name) = tool["name"].as_str() else {
        warn!("dropping tool definition without a `name`: {tool}");
        return None;
    };
    let parameters = match &tool["input_schema"] {
        Value::Null => json!({}),
        schema => schema.clone(),
    };
    let mut function = json!({ "name": name, "parameters": parameters });
    if let Some(description) = tool["description"].as_str() {
        function["description"] = json!(description);
    }
    Some(json!({ "type": "function", "function": function }))
}

fn lower_tool_choice(choice: &Value) -> Option<Value> {
    match choice {
        Value::Null => None,
        Value::String(s) => match s.as_str() {
            "auto" => Some(json!("auto")),
            "any" => Some(json!("required")),
            other => {
                warn!(choice = other, "unrecognised tool_choice string — passing through");
                Some(json!(other))
            }
        },
        Value::Object(obj) => match obj.get("type").and_then(Value::as_str) {
            Some("auto") => Some(json!("auto")),
            Some("any") => Some(json!("required")),
            Some("tool") => obj.get("name").and_then(Value::as_str).map(|name| {
                json!({ "type": "function", "function": { "name": name } })
            }),
            _ => None,
        },
        _ => None,
    }
}

/// `call_<timestamp>_<random6>` — used when a tool_use part arrives without an id.
fn synthesise_call_id() -> String {
    use rand::Rng as _;
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("call_{}_{}", chrono::Utc::now().timestamp_millis(), suffix)
}

// ---------------------------------------------------------------------------
// Response raising (OpenAI → Anthropic)
// ---------------------------------------------------------------------------

pub(crate) fn raise_response(response: &Value) -> Result<Value, PipelineError> {
    let message = response
        .pointer("/choices/0/message")
        .ok_or_else(|| PipelineError::Transform("upstream response has no choices".into()))?;

    let mut content: Vec<Value> = Vec::new();

    // `content` precedes `tool_calls` in the upstream message, so text parts
    // keep their position ahead of tool_use parts.
    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            content.push(json!({ "type": "text", "text": text }));
        }
    }

    if let Some(tool_calls) = message["tool_calls"].as_array() {
        for call in tool_calls {
            let name = call
                .pointer("/function/name")
                .and_then(Value::as_str)
                .ok_or_else(|| PipelineError::Transform("tool call without a function name".into()))?;
            let arguments = call.pointer("/function/arguments").and_then(Value::as_str).unwrap_or("{}");
            let input = serde_json::from_str::<Value>(arguments).unwrap_or_else(|e| {
                warn!(tool = name, error = %e, "tool call arguments are not valid JSON — using empty input");
                json!({})
            });
            let id = call["id"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(synthesise_call_id);
            content.push(json!({ "type": "tool_use", "id": id, "name": name, "input": input }));
        }
    }

    let stop_reason = match response.pointer("/choices/0/finish_reason").and_then(Value::as_str) {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        Some("content_filter") => "stop_sequence",
        _ => "end_turn",
    };

    Ok(json!({
        "id": response["id"].as_str().map(str::to_string)
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
        "type": "message",
        "role": "assistant",
        "model": response["model"].as_str().unwrap_or("unknown"),
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": response.pointer("/usage/prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
            "output_tokens": response.pointer("/usage/completion_tokens").and_then(Value::as_u64).unwrap_or(0),
        },
    }))
}

// ---------------------------------------------------------------------------
// Request raising (OpenAI → Anthropic) — inverse of `lower_request`
// ---------------------------------------------------------------------------

/// Raise an OpenAI-shaped request back into the Messages schema. Lossless up
/// to system-message joining and synthesised tool-call ids; round-trip
/// verification leans on this.
#[cfg(test)]
pub(crate) fn raise_request(request: &Value) -> Result<Value, PipelineError> {
    let raw_messages = request["messages"]
        .as_array()
        .ok_or_else(|| PipelineError::Transform("`messages` array is required".into()))?;

    let mut system_parts: Vec<&str> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for message in raw_messages {
        let role = message["role"].as_str().unwrap_or("user");
        if role == "system" {
            if let Some(text) = message["content"].as_str() {
                system_parts.push(text);
            }
            continue;
        }

        let mut parts: Vec<Value> = Vec::new();
        if let Some(text) = message["content"].as_str() {
            if let Some(rest) = text.strip_prefix(TOOL_RESULT_PREFIX) {
                if let Some((id, result)) = rest.split_once("]: ") {
                    messages.push(json!({
                        "role": "user",
                        "content": [{ "type": "tool_result", "tool_use_id": id, "content": result }],
                    }));
                    continue;
                }
            }
            if !text.is_empty() {
                parts.push(json!({ "type": "text", "text": text }));
            }
        }
        if let Some(calls) = message["tool_calls"].as_array() {
            for call in calls {
                let input = call
                    .pointer("/function/arguments")
                    .and_then(Value::as_str)
                    .and_then(|a| serde_json::from_str::<Value>(a).ok())
                    .unwrap_or_else(|| json!({}));
                parts.push(json!({
                    "type": "tool_use",
                    "id": call["id"].as_str().map(str::to_string).unwrap_or_else(synthesise_call_id),
                    "name": call.pointer("/function/name").and_then(Value::as_str).unwrap_or_default(),
                    "input": input,
                }));
            }
        }
        if !parts.is_empty() {
            messages.push(json!({ "role": role, "content": parts }));
        }
    }

    let mut out = Map::new();
    out.insert("model".into(), request["model"].clone());
    if !system_parts.is_empty() {
        out.insert("system".into(), json!(system_parts.join(" ")));
    }
    out.insert("messages".into(), Value::Array(messages));
    if let Some(max_tokens) = request["max_tokens"].as_u64() {
        out.insert("max_tokens".into(), json!(max_tokens));
    }
    for key in ["temperature", "top_p", "top_k"] {
        if let Some(v) = request.get(key) {
            if !v.is_null() {
                out.insert(key.into(), v.clone());
            }
        }
    }
    if let Some(stop) = request.get("stop") {
        if !stop.is_null() {
            out.insert("stop_sequences".into(), stop.clone());
        }
    }
    if let Some(tools) = request["tools"].as_array() {
        let raised: Vec<Value> = tools
            .iter()
            .filter_map(|t| {
                let name = t.pointer("/function/name")?.as_str()?;
                let mut tool = json!({
                    "name": name,
                    "input_schema": t.pointer("/function/parameters").cloned().unwrap_or_else(|| json!({})),
                });
                if let Some(desc) = t.pointer("/function/description").and_then(Value::as_str) {
                    tool["description"] = json!(desc);
                }
                Some(tool)
            })
            .collect();
        if !raised.is_empty() {
            out.insert("tools".into(), Value::Array(raised));
        }
    }

    Ok(Value::Object(out))
}

// ---------------------------------------------------------------------------
// Validation contracts
// ---------------------------------------------------------------------------

/// "Valid OpenAI request": non-empty object, has `model`, `messages` is a
/// list, every tool is `{type: "function", function: {name, …}}`.
pub(crate) fn validate_openai_request(request: &Value) -> Result<(), String> {
    let obj = request.as_object().filter(|o| !o.is_empty()).ok_or("request is not a non-empty object")?;
    if !obj.get("model").map(Value::is_string).unwrap_or(false) {
        return Err("request has no `model`".into());
    }
    if !obj.get("messages").map(Value::is_array).unwrap_or(false) {
        return Err("`messages` is not a list".into());
    }
    if let Some(tools) = obj.get("tools") {
        let tools = tools.as_array().ok_or("`tools` is not a list")?;
        for (i, tool) in tools.iter().enumerate() {
            if tool["type"] != "function" || !tool.pointer("/function/name").map(Value::is_string).unwrap_or(false) {
                return Err(format!("tools[{i}] is not a well-formed function tool"));
            }
        }
    }
    Ok(())
}

/// "Valid Anthropic response": object, `type == "message"`, `content` is a list.
pub(crate) fn validate_anthropic_response(response: &Value) -> Result<(), String> {
    if !response.is_object() {
        return Err("response is not an object".into());
    }
    if response["type"] != "message" {
        return Err("response `type` is not \"message\"".into());
    }
    if !response["content"].is_array() {
        return Err("response `content` is not a list".into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
