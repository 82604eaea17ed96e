//! Fallback tool-call plaintext parser (spec §4.7, debug toggle): when a
//! provider reports `finish_reason = "tool_calls"` but emitted no
//! structured calls — observed against some OpenAI-compatible endpoints
//! that echo function calls as fenced JSON instead of populating the
//! `tool_calls` array — scan the assistant's plaintext for a well-known
//! invocation shape and synthesize calls from it.
//!
//! Recognized shape: a fenced code block tagged `tool_call` containing a
//! JSON object `{"name": "...", "arguments": {...}}`, one call per block.

use eclia_llm::AccumulatedToolCall;
use regex::Regex;
use std::sync::OnceLock;

fn tool_call_block_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)```tool_call\s*\n(.*?)\n```").expect("static pattern is valid regex")
    })
}

/// Returns `None` if no recognizable tool-call block is present, so the
/// caller can distinguish "nothing to fall back to" from "parsed zero
/// calls".
pub fn try_fallback_parse_tool_calls(assistant_text: &str) -> Option<Vec<AccumulatedToolCall>> {
    let mut calls = Vec::new();
    for (index, capture) in tool_call_block_pattern().captures_iter(assistant_text).enumerate() {
        let body = capture.get(1)?.as_str();
        let parsed: serde_json::Value = serde_json::from_str(body).ok()?;
        let name = parsed.get("name")?.as_str()?.to_string();
        let arguments = parsed
            .get("arguments")
            .cloned()
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
        calls.push(AccumulatedToolCall {
            id: format!("fallback-{index}"),
            name,
            arguments: arguments.to_string(),
            index: Some(index),
        });
    }
    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_tool_call_block() {
        let text = "I'll run that.\n```tool_call\n{\"name\": \"exec\", \"arguments\": {\"cmd\": \"ls\"}}\n```\n";
        let calls = try_fallback_parse_tool_calls(text).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "exec");
        assert!(calls[0].arguments.contains("ls"));
    }

    #[test]
    fn plain_text_has_no_fallback() {
        assert!(try_fallback_parse_tool_calls("just a normal reply").is_none());
    }

    #[test]
    fn parses_multiple_blocks_in_order() {
        let text = "\
```tool_call\n{\"name\": \"a\", \"arguments\": {}}\n```\nthen\n```tool_call\n{\"name\": \"b\", \"arguments\": {}}\n```";
        let calls = try_fallback_parse_tool_calls(text).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "a");
        assert_eq!(calls[1].name, "b");
    }
}
