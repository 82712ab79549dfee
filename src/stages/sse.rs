//! Streaming translation — OpenAI chunk SSE in, Anthropic event SSE out.
//!
//! Upstream chat-completion chunks arrive as `data:` lines; each one is
//! translated the moment it is parsed, so events leave in exactly the order
//! they arrived. Partial tool-call arguments are forwarded as
//! `input_json_delta` events without coalescing.
//!
//! Event sequence produced for a typical upstream stream:
//!
//! ```text
//! message_start
//! content_block_start (text)
//! content_block_delta (text_delta) …
//! content_block_stop
//! content_block_start (tool_use)
//! content_block_delta (input_json_delta) …
//! content_block_stop
//! message_delta (stop_reason, usage)
//! message_stop
//! ```

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use futures_util::StreamExt as _;
use serde_json::{json, Value};
use tracing::warn;

use super::SseStream;

/// Wrap an upstream OpenAI SSE byte stream into an Anthropic SSE byte stream.
///
/// The translator closes any open blocks and emits `message_delta` /
/// `message_stop` on `data: [DONE]`, and also when the upstream stream ends
/// without one.
pub fn translate_stream(upstream: SseStream) -> SseStream {
    let state = TranslateState {
        upstream,
        translator: StreamTranslator::new(),
        buffer: String::new(),
        queue: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(bytes) = st.queue.pop_front() {
                return Some((Ok(bytes), st));
            }
            if st.finished {
                return None;
            }

            match st.upstream.next().await {
                Some(Ok(chunk)) => {
                    st.buffer.push_str(&String::from_utf8_lossy(&chunk));
                    while let Some(newline) = st.buffer.find('\n') {
                        let line: String = st.buffer.drain(..=newline).collect();
                        for event in st.translator.on_line(line.trim_end()) {
                            st.queue.push_back(event);
                        }
                    }
                    if st.translator.done {
                        st.finished = true;
                    }
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(e), st));
                }
                None => {
                    // Upstream closed without [DONE]; finish cleanly.
                    for event in st.translator.finish() {
                        st.queue.push_back(event);
                    }
                    st.finished = true;
                }
            }
        }
    }))
}

struct TranslateState {
    upstream: SseStream,
    translator: StreamTranslator,
    buffer: String,
    queue: VecDeque<Bytes>,
    finished: bool,
}

/// Per-stream translation state. One instance per response; never shared.
struct StreamTranslator {
    started: bool,
    done: bool,
    next_index: u64,
    /// Index of the currently open text block, if any.
    text_block: Option<u64>,
    /// Upstream tool_call index → our content block index.
    tool_blocks: BTreeMap<u64, u64>,
    /// The most recently opened block; Anthropic blocks close in open order.
    open_block: Option<u64>,
    stop_reason: &'static str,
    output_tokens: u64,
}

impl StreamTranslator {
    fn new() -> Self {
        Self {
            started: false,
            done: false,
            next_index: 0,
            text_block: None,
            tool_blocks: BTreeMap::new(),
            open_block: None,
            stop_reason: "end_turn",
            output_tokens: 0,
        }
    }

    fn on_line(&mut self, line: &str) -> Vec<Bytes> {
        let Some(data) = line.strip_prefix("data:").map(str::trim) else {
            return Vec::new(); // comments, event names, blank keep-alives
        };
        if data == "[DONE]" {
            return self.finish();
        }
        match serde_json::from_str::<Value>(data) {
            Ok(chunk) => self.on_chunk(&chunk),
            Err(e) => {
                warn!(error = %e, "skipping unparseable upstream SSE chunk");
                Vec::new()
            }
        }
    }

    fn on_chunk(&mut self, chunk: &Value) -> Vec<Bytes> {
        let mut events = Vec::new();

        if !self.started {
            self.started = true;
            events.push(render(
                "message_start",
                &json!({
                    "type": "message_start",
                    "message": {
                        "id": chunk["id"].as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
                        "type": "message",
                        "role": "assistant",
                        "model": chunk["model"].as_str().unwrap_or("unknown"),
                        "content": [],
                        "stop_reason": Value::Null,
                        "usage": { "input_tokens": 0, "output_tokens": 0 },
                    },
                }),
            ));
        }

        if let Some(tokens) = chunk.pointer("/usage/completion_tokens").and_then(Value::as_u64) {
            self.output_tokens = tokens;
        }

        let delta = &chunk["choices"][0]["delta"];

        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                let index = match self.text_block {
                    Some(index) => index,
                    None => {
                        let index = self.open_block_at(&mut events, json!({ "type": "text", "text": "" }));
                        self.text_block = Some(index);
                        index
                    }
                };
                events.push(render(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": { "type": "text_delta", "text": text },
                    }),
                ));
            }
        }

        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let upstream_index = call["index"].as_u64().unwrap_or(0);
                let index = match self.tool_blocks.get(&upstream_index) {
                    Some(&index) => index,
                    None => {
                        let index = self.open_block_at(
                            &mut events,
                            json!({
                                "type": "tool_use",
                                "id": call["id"].as_str()
                                    .map(str::to_string)
                                    .unwrap_or_else(|| format!("call_{upstream_index}")),
                                "name": call.pointer("/function/name").and_then(Value::as_str).unwrap_or_default(),
                                "input": {},
                            }),
                        );
                        self.tool_blocks.insert(upstream_index, index);
                        index
                    }
                };
                if let Some(partial) = call.pointer("/function/arguments").and_then(Value::as_str) {
                    if !partial.is_empty() {
                        events.push(render(
                            "content_block_delta",
                            &json!({
                                "type": "content_block_delta",
                                "index": index,
                                "delta": { "type": "input_json_delta", "partial_json": partial },
                            }),
                        ));
                    }
                }
            }
        }

        if let Some(reason) = chunk.pointer("/choices/0/finish_reason").and_then(Value::as_str) {
            self.stop_reason = match reason {
                "length" => "max_tokens",
                "tool_calls" => "tool_use",
                "content_filter" => "stop_sequence",
                _ => "end_turn",
            };
        }

        events
    }

    /// Close the currently open block (if any) and start a new one.
    fn open_block_at(&mut self, events: &mut Vec<Bytes>, block: Value) -> u64 {
        self.close_open_block(events);
        let index = self.next_index;
        self.next_index += 1;
        self.open_block = Some(index);
        events.push(render(
            "content_block_start",
            &json!({ "type": "content_block_start", "index": index, "content_block": block }),
        ));
        index
    }

    fn close_open_block(&mut self, events: &mut Vec<Bytes>) {
        if let Some(index) = self.open_block.take() {
            if self.text_block == Some(index) {
                self.text_block = None;
            }
            events.push(render(
                "content_block_stop",
                &json!({ "type": "content_block_stop", "index": index }),
            ));
        }
    }

    fn finish(&mut self) -> Vec<Bytes> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        let mut events = Vec::new();
        if !self.started {
            // Nothing arrived at all; still emit a well-formed pair.
            self.started = true;
            events.push(render(
                "message_start",
                &json!({
                    "type": "message_start",
                    "message": {
                        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
                        "type": "message",
                        "role": "assistant",
                        "model": "unknown",
                        "content": [],
                        "stop_reason": Value::Null,
                        "usage": { "input_tokens": 0, "output_tokens": 0 },
                    },
                }),
            ));
        }
        self.close_open_block(&mut events);
        events.push(render(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": { "stop_reason": self.stop_reason, "stop_sequence": Value::Null },
                "usage": { "output_tokens": self.output_tokens },
            }),
        ));
        events.push(render("message_stop", &json!({ "type": "message_stop" })));
        events
    }
}

fn render(event: &str, data: &Value) -> Bytes {
    Bytes::from(format!("event: {event}\ndata: {data}\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt as _};

    fn upstream_from(lines: &[&str]) -> SseStream {
        let chunks: Vec<anyhow::Result<Bytes>> = lines
            .iter()
            .map(|l| Ok(Bytes::from(format!("{l}\n"))))
            .collect();
        Box::pin(stream::iter(chunks))
    }

    async fn collect_events(upstream: SseStream) -> Vec<(String, Value)> {
        let bytes: Vec<Bytes> = translate_stream(upstream)
            .map(|r| r.expect("stream item"))
            .collect()
            .await;
        let text = bytes.iter().map(|b| String::from_utf8_lossy(b).to_string()).collect::<String>();
        text.split("\n\n")
            .filter(|frame| !frame.is_empty())
            .map(|frame| {
                let mut lines = frame.lines();
                let event = lines.next().unwrap().strip_prefix("event: ").unwrap().to_string();
                let data = lines.next().unwrap().strip_prefix("data: ").unwrap();
                (event, serde_json::from_str(data).unwrap())
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Text streaming
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn text_stream_produces_full_event_sequence() {
        let upstream = upstream_from(&[
            r#"data: {"id":"chatcmpl-1","model":"m","choices":[{"delta":{"role":"assistant","content":"Hel"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            "data: [DONE]",
        ]);
        let events = collect_events(upstream).await;
        let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();

        assert_eq!(
            names,
            [
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        assert_eq!(events[0].1["message"]["id"], "chatcmpl-1");
        assert_eq!(events[2].1["delta"]["text"], "Hel");
        assert_eq!(events[3].1["delta"]["text"], "lo");
        assert_eq!(events[5].1["delta"]["stop_reason"], "end_turn");
    }

    #[tokio::test]
    async fn deltas_preserve_upstream_order() {
        let upstream = upstream_from(&[
            r#"data: {"choices":[{"delta":{"content":"a"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"b"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"c"}}]}"#,
            "data: [DONE]",
        ]);
        let events = collect_events(upstream).await;
        let texts: Vec<&str> = events
            .iter()
            .filter(|(n, _)| n == "content_block_delta")
            .map(|(_, d)| d["delta"]["text"].as_str().unwrap())
            .collect();
        assert_eq!(texts, ["a", "b", "c"]);
    }

    // -----------------------------------------------------------------------
    // Tool-call streaming
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn tool_call_deltas_become_input_json_deltas() {
        let upstream = upstream_from(&[
            r#"data: {"choices":[{"delta":{"content":"Checking."}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"get_weather","arguments":""}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"location\":"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"SF\"}"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "data: [DONE]",
        ]);
        let events = collect_events(upstream).await;

        // Text block closes before the tool block opens.
        let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            [
                "message_start",
                "content_block_start",  // text
                "content_block_delta",
                "content_block_stop",   // text closed
                "content_block_start",  // tool_use
                "content_block_delta",  // input_json_delta
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        let tool_start = &events[4].1;
        assert_eq!(tool_start["content_block"]["type"], "tool_use");
        assert_eq!(tool_start["content_block"]["id"], "call_1");
        assert_eq!(tool_start["content_block"]["name"], "get_weather");

        let partials: Vec<&str> = events
            .iter()
            .filter(|(_, d)| d["delta"]["type"] == "input_json_delta")
            .map(|(_, d)| d["delta"]["partial_json"].as_str().unwrap())
            .collect();
        assert_eq!(partials, ["{\"location\":", "\"SF\"}"]);

        let message_delta = &events[8].1;
        assert_eq!(message_delta["delta"]["stop_reason"], "tool_use");
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn upstream_ending_without_done_still_finishes() {
        let upstream = upstream_from(&[
            r#"data: {"choices":[{"delta":{"content":"partial"}}]}"#,
        ]);
        let events = collect_events(upstream).await;
        let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names.last(), Some(&"message_stop"));
        assert!(names.contains(&"content_block_stop"));
    }

    #[tokio::test]
    async fn empty_upstream_yields_wellformed_pair() {
        let events = collect_events(upstream_from(&[])).await;
        let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["message_start", "message_delta", "message_stop"]);
    }

    #[tokio::test]
    async fn unparseable_chunks_are_skipped() {
        let upstream = upstream_from(&[
            "data: {broken json",
            r#"data: {"choices":[{"delta":{"content":"ok"}}]}"#,
            "data: [DONE]",
        ]);
        let events = collect_events(upstream).await;
        let texts: Vec<&str> = events
            .iter()
            .filter(|(n, _)| n == "content_block_delta")
            .map(|(_, d)| d["delta"]["text"].as_str().unwrap())
            .collect();
        assert_eq!(texts, ["ok"]);
    }

    #[tokio::test]
    async fn usage_flows_into_message_delta() {
        let upstream = upstream_from(&[
            r#"data: {"choices":[{"delta":{"content":"hi"}}]}"#,
            r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"completion_tokens":7}}"#,
            "data: [DONE]",
        ]);
        let events = collect_events(upstream).await;
        let delta = events.iter().find(|(n, _)| n == "message_delta").unwrap();
        assert_eq!(delta.1["usage"]["output_tokens"], 7);
    }
}
