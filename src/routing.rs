//! Routing input features and route selection.
//!
//! The HTTP collaborator calls [`select_route`] when no explicit route hint
//! accompanies a request. Features are cheap to derive: a token estimate over
//! the textual content plus three boolean flags read straight off the body.

use std::sync::OnceLock;

use serde_json::Value;
use tiktoken_rs::CoreBPE;
use tracing::warn;

/// Requests estimated above this many tokens go to the `longContext` route.
pub const LONG_CONTEXT_THRESHOLD: usize = 60_000;

/// Per-request routing signals.
#[derive(Debug, Clone, Default)]
pub struct RoutingFeatures {
    pub token_estimate: usize,
    pub is_background: bool,
    pub has_thinking: bool,
    pub has_web_search: bool,
}

impl RoutingFeatures {
    pub fn from_request(request: &Value) -> Self {
        let model = request["model"].as_str().unwrap_or_default();
        let has_web_search = request["tools"]
            .as_array()
            .map(|tools| {
                tools.iter().any(|t| {
                    t["type"].as_str().is_some_and(|ty| ty.starts_with("web_search"))
                        || t["name"].as_str().is_some_and(|n| n.contains("web_search"))
                })
            })
            .unwrap_or(false);

        Self {
            token_estimate: estimate_tokens(request),
            is_background: model.contains("haiku"),
            has_thinking: request["thinking"].is_object(),
            has_web_search,
        }
    }
}

/// Pick a route name for the given features.
///
/// Priority: `longContext` > `background` > `think` > `webSearch` >
/// `default`. A route only wins when `available` says a pipeline backs it;
/// otherwise selection falls through to the next candidate.
pub fn select_route(features: &RoutingFeatures, available: impl Fn(&str) -> bool) -> String {
    let candidate = if features.token_estimate > LONG_CONTEXT_THRESHOLD {
        "longContext"
    } else if features.is_background {
        "background"
    } else if features.has_thinking {
        "think"
    } else if features.has_web_search {
        "webSearch"
    } else {
        "default"
    };

    if candidate != "default" && !available(candidate) {
        warn!(route = candidate, "selected route has no pipeline — falling back to default");
        return "default".into();
    }
    candidate.into()
}

/// Cheap token estimate over the request's textual content.
///
/// Uses the cl100k tokenizer; counting is approximate by design (system and
/// message text only — tool schemas are ignored).
pub fn estimate_tokens(request: &Value) -> usize {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    let bpe = BPE.get_or_init(|| tiktoken_rs::cl100k_base().expect("cl100k tokenizer"));

    let mut text = String::new();
    if let Some(system) = request["system"].as_str() {
        text.push_str(system);
        text.push('\n');
    }
    if let Some(parts) = request["system"].as_array() {
        for part in parts {
            if let Some(t) = part["text"].as_str() {
                text.push_str(t);
                text.push('\n');
            }
        }
    }
    if let Some(messages) = request["messages"].as_array() {
        for message in messages {
            match &message["content"] {
                Value::String(s) => {
                    text.push_str(s);
                    text.push('\n');
                }
                Value::Array(parts) => {
                    for part in parts {
                        if let Some(t) = part["text"].as_str() {
                            text.push_str(t);
                            text.push('\n');
                        }
                    }
                }
                _ => {}
            }
        }
    }

    bpe.encode_ordinary(&text).len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn all_routes(_: &str) -> bool {
        true
    }

    // -----------------------------------------------------------------------
    // Feature extraction
    // -----------------------------------------------------------------------

    #[test]
    fn plain_request_has_no_flags() {
        let features = RoutingFeatures::from_request(&json!({
            "model": "claude-3-opus-20240229",
            "messages": [{ "role": "user", "content": "hi" }],
        }));
        assert!(!features.is_background);
        assert!(!features.has_thinking);
        assert!(!features.has_web_search);
        assert!(features.token_estimate > 0);
    }

    #[test]
    fn haiku_models_are_background() {
        let features = RoutingFeatures::from_request(&json!({
            "model": "claude-3-5-haiku-20241022", "messages": [],
        }));
        assert!(features.is_background);
    }

    #[test]
    fn thinking_block_sets_flag() {
        let features = RoutingFeatures::from_request(&json!({
            "model": "m", "messages": [],
            "thinking": { "type": "enabled", "budget_tokens": 4096 },
        }));
        assert!(features.has_thinking);
    }

    #[test]
    fn web_search_tool_sets_flag() {
        let by_type = RoutingFeatures::from_request(&json!({
            "model": "m", "messages": [],
            "tools": [{ "type": "web_search_20250305", "name": "web_search" }],
        }));
        assert!(by_type.has_web_search);

        let by_name = RoutingFeatures::from_request(&json!({
            "model": "m", "messages": [],
            "tools": [{ "name": "web_search", "input_schema": {} }],
        }));
        assert!(by_name.has_web_search);
    }

    // -----------------------------------------------------------------------
    // Selection priority
    // -----------------------------------------------------------------------

    #[test]
    fn defaults_when_nothing_matches() {
        assert_eq!(select_route(&RoutingFeatures::default(), all_routes), "default");
    }

    #[test]
    fn long_context_beats_everything() {
        let features = RoutingFeatures {
            token_estimate: LONG_CONTEXT_THRESHOLD + 1,
            is_background: true,
            has_thinking: true,
            has_web_search: true,
        };
        assert_eq!(select_route(&features, all_routes), "longContext");
    }

    #[test]
    fn background_beats_think_and_web_search() {
        let features = RoutingFeatures {
            is_background: true,
            has_thinking: true,
            has_web_search: true,
            ..Default::default()
        };
        assert_eq!(select_route(&features, all_routes), "background");
    }

    #[test]
    fn think_beats_web_search() {
        let features = RoutingFeatures {
            has_thinking: true,
            has_web_search: true,
            ..Default::default()
        };
        assert_eq!(select_route(&features, all_routes), "think");
    }

    #[test]
    fn unbacked_route_falls_back_to_default() {
        let features = RoutingFeatures { has_thinking: true, ..Default::default() };
        assert_eq!(select_route(&features, |_| false), "default");
    }

    // -----------------------------------------------------------------------
    // Token estimation
    // -----------------------------------------------------------------------

    #[test]
    fn estimate_counts_system_and_message_text() {
        let small = estimate_tokens(&json!({
            "system": "short",
            "messages": [{ "role": "user", "content": "hi" }],
        }));
        let large = estimate_tokens(&json!({
            "system": "short",
            "messages": [{ "role": "user", "content": "hello world ".repeat(500) }],
        }));
        assert!(small < large);
        assert!(small > 0);
    }

    #[test]
    fn estimate_handles_content_parts() {
        let tokens = estimate_tokens(&json!({
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": "some text here" },
                    { "type": "tool_result", "tool_use_id": "t", "content": "ignored" },
                ],
            }],
        }));
        assert!(tokens > 0);
    }
}
