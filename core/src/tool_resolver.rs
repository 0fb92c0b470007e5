//! Turns a model reply into the canonical list of tool calls.
//!
//! Structured calls win. Models without native tool calling may instead
//! reply with a JSON object (or array of objects) naming the tool. Anything
//! else is a final answer.

use std::collections::HashSet;

use tracing::debug;

use crate::client_common::LlmResponse;
use crate::models::LlmToolCall;
use crate::models::ToolCall;

/// Resolves calls for one turn, keeping call ids unique across its steps.
#[derive(Debug, Default)]
pub struct ToolCallResolver {
    seen_ids: HashSet<String>,
}

impl ToolCallResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the calls requested by `response`; empty means the reply is a
    /// final answer. Calls without an id (or with one already used in this
    /// turn) get `"{step}-{position}"`.
    pub fn resolve(&mut self, response: &LlmResponse, step: usize) -> Vec<ToolCall> {
        let calls = if response.tool_calls.is_empty() {
            parse_text_tool_calls(&response.text).unwrap_or_default()
        } else {
            response.tool_calls.clone()
        };

        calls
            .into_iter()
            .enumerate()
            .map(|(position, call)| {
                let call_id = match call.call_id {
                    Some(id) if !id.is_empty() && !self.seen_ids.contains(&id) => id,
                    Some(id) if !id.is_empty() => {
                        let fresh = self.synthesize_id(step, position);
                        debug!(
                            duplicate = %id,
                            call_id = %fresh,
                            "call id reused within turn; replaced"
                        );
                        fresh
                    }
                    _ => self.synthesize_id(step, position),
                };
                self.seen_ids.insert(call_id.clone());
                ToolCall {
                    tool_name: call.tool_name,
                    arguments: call.arguments,
                    call_id,
                }
            })
            .collect()
    }

    fn synthesize_id(&self, step: usize, position: usize) -> String {
        let base = format!("{step}-{position}");
        if !self.seen_ids.contains(&base) {
            return base;
        }
        (1..)
            .map(|n| format!("{base}-{n}"))
            .find(|id| !self.seen_ids.contains(id))
            .unwrap_or(base)
    }
}

/// Parses a free-text reply as one tool call object or an array of them.
/// Returns `None` unless every element is a well-formed call.
pub fn parse_text_tool_calls(text: &str) -> Option<Vec<LlmToolCall>> {
    let body = strip_code_fence(text.trim());
    let calls = if body.starts_with('{') {
        vec![serde_json::from_str::<LlmToolCall>(body).ok()?]
    } else if body.starts_with('[') {
        serde_json::from_str::<Vec<LlmToolCall>>(body).ok()?
    } else {
        return None;
    };

    if calls.is_empty() || calls.iter().any(|call| !is_well_formed(call)) {
        debug!("free-text reply looks like JSON but is not a tool call");
        return None;
    }
    Some(calls)
}

/// A named tool whose `arguments` are an object or absent.
fn is_well_formed(call: &LlmToolCall) -> bool {
    !call.tool_name.trim().is_empty()
        && matches!(
            call.arguments,
            serde_json::Value::Null | serde_json::Value::Object(_)
        )
}

/// Strips one surrounding Markdown code fence, with or without a language
/// tag.
fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(rest) = rest.strip_suffix("```") else {
        return text;
    };
    // Drop the info string (e.g. `json`) on the opening line.
    match rest.split_once('\n') {
        Some((_info, body)) => body.trim(),
        None => rest.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn text(s: &str) -> LlmResponse {
        LlmResponse {
            text: s.to_string(),
            tool_calls: Vec::new(),
        }
    }

    #[test]
    fn structured_calls_are_used_verbatim() {
        let response = LlmResponse {
            text: r#"{"tool_name": "ignored"}"#.to_string(),
            tool_calls: vec![LlmToolCall {
                tool_name: "shell".to_string(),
                arguments: json!({"command": ["ls"]}),
                call_id: Some("call_abc".to_string()),
            }],
        };
        let calls = ToolCallResolver::new().resolve(&response, 1);
        assert_eq!(
            calls,
            vec![ToolCall {
                tool_name: "shell".to_string(),
                arguments: json!({"command": ["ls"]}),
                call_id: "call_abc".to_string(),
            }]
        );
    }

    #[test]
    fn free_text_object_and_array_are_parsed() {
        let mut resolver = ToolCallResolver::new();
        let calls = resolver.resolve(
            &text(r#"{"tool_name": "read_file", "arguments": {"path": "a.txt"}}"#),
            2,
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call_id, "2-0");

        let calls = resolver.resolve(
            &text(
                "```json\n[{\"tool_name\": \"read_file\", \"arguments\": {\"path\": \"a\"}}, {\"tool_name\": \"shell\", \"arguments\": {\"command\": [\"ls\"]}, \"call_id\": \"x\"}]\n```",
            ),
            3,
        );
        let ids: Vec<&str> = calls.iter().map(|c| c.call_id.as_str()).collect();
        assert_eq!(ids, vec!["3-0", "x"]);
    }

    #[test]
    fn malformed_element_makes_the_reply_text() {
        assert_eq!(
            parse_text_tool_calls(r#"[{"tool_name": "shell"}, {"arguments": {}}]"#),
            None
        );
        assert_eq!(parse_text_tool_calls(r#"{"tool_name": ""}"#), None);
        assert_eq!(
            parse_text_tool_calls(r#"{"tool_name": "read_file", "arguments": "{\"path\": \"a\"}"}"#),
            None
        );
        assert_eq!(
            parse_text_tool_calls(r#"{"tool_name": "shell", "arguments": ["ls"]}"#),
            None
        );
        assert_eq!(parse_text_tool_calls("[]"), None);
        assert_eq!(parse_text_tool_calls("All done, the tests pass."), None);
        assert_eq!(parse_text_tool_calls("{not json"), None);
    }

    #[test]
    fn duplicate_ids_within_a_turn_are_replaced() {
        let mut resolver = ToolCallResolver::new();
        let call = |id: &str| LlmToolCall {
            tool_name: "shell".to_string(),
            arguments: json!({"command": ["true"]}),
            call_id: Some(id.to_string()),
        };
        let first = resolver.resolve(
            &LlmResponse {
                text: String::new(),
                tool_calls: vec![call("1-1")],
            },
            1,
        );
        let second = resolver.resolve(
            &LlmResponse {
                text: String::new(),
                tool_calls: vec![call("1-1"), call("1-1")],
            },
            1,
        );
        assert_eq!(first[0].call_id, "1-1");
        assert_eq!(second[0].call_id, "1-0");
        assert_eq!(second[1].call_id, "1-1-1");
    }
}
