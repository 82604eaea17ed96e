//! Provider-agnostic request/response shapes shared by all three upstream
//! adapters (spec §4.5).

use serde::{Deserialize, Serialize};

/// One message in the provider-agnostic transcript view fed to
/// `streamTurn`. Built from `eclia_core::TranscriptRecord`s by the turn
/// orchestrator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: LlmContent,
    /// Set only for OpenAI-compatible `tool`-role messages, where the wire
    /// format links a result back to its call by id rather than nesting a
    /// `tool_result` content block the way Anthropic does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl LlmMessage {
    pub fn new(role: impl Into<String>, content: impl Into<LlmContent>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == "system"
    }

    pub fn is_tool(&self) -> bool {
        self.role == "tool"
    }

    pub fn text(&self) -> String {
        match &self.content {
            LlmContent::Text(s) => s.clone(),
            LlmContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// Message content — plain text, or a list of typed blocks once tool calls
/// or tool results are involved.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LlmContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl From<String> for LlmContent {
    fn from(s: String) -> Self {
        LlmContent::Text(s)
    }
}

impl From<&str> for LlmContent {
    fn from(s: &str) -> Self {
        LlmContent::Text(s.to_string())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// A tool schema exposed to the upstream provider for function-calling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Optional sampling overrides, bounds per spec §4.5.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SamplingOverrides {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_output_tokens: Option<u32>,
}

impl SamplingOverrides {
    /// Clamps every field to the range spec §4.5 mandates.
    pub fn clamped(mut self) -> Self {
        if let Some(t) = self.temperature {
            self.temperature = Some(t.clamp(0.0, 2.0));
        }
        if let Some(p) = self.top_p {
            self.top_p = Some(p.clamp(0.0, 1.0));
        }
        if let Some(k) = self.top_k {
            self.top_k = Some(k.clamp(1, 1000));
        }
        if let Some(m) = self.max_output_tokens {
            self.max_output_tokens = Some(m.clamp(1, 200_000));
        }
        self
    }
}

/// Input contract for `streamTurn` (spec §4.5).
#[derive(Clone, Debug)]
pub struct StreamTurnRequest {
    pub model: String,
    pub messages: Vec<LlmMessage>,
    pub tools: Vec<LlmTool>,
    pub system: Option<String>,
    pub sampling: SamplingOverrides,
}

/// Output contract for `streamTurn`.
#[derive(Clone, Debug, Default)]
pub struct StreamTurnOutput {
    pub assistant_text: String,
    pub tool_calls: Vec<AccumulatedToolCall>,
    pub finish_reason: Option<String>,
}

/// Streaming delta emitted while a turn is in flight.
#[derive(Clone, Debug)]
pub enum StreamDelta {
    Text(String),
    Thinking(String),
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallDelta {
        id: String,
        arguments: String,
    },
    ToolCallEnd {
        id: String,
    },
    Done {
        stop_reason: Option<String>,
        usage: Option<Usage>,
    },
    Error(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A tool call accumulated over the course of a stream, keyed by `id`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccumulatedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
    /// Preserves array-index ordering for providers (OpenAI-compatible) that
    /// key streamed tool-call deltas by position rather than id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl AccumulatedToolCall {
    pub fn parse_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&self.arguments)
    }
}

/// Result of `buildContext` (spec §4.5): a truncated, schema-appropriate
/// message list plus a used-token estimate and drop count.
#[derive(Clone, Debug)]
pub struct BuildContextResult {
    pub messages: Vec<LlmMessage>,
    pub used_tokens: usize,
    pub dropped: usize,
}

const CHARS_PER_TOKEN: f32 = 4.0;

/// Conservative byte-based token estimator (spec §4.5: "no vendor SDK
/// calls"). Shared by every provider's `build_context` implementation.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() as f32 / CHARS_PER_TOKEN).ceil() as usize
}

pub fn message_tokens(message: &LlmMessage) -> usize {
    let content_tokens = match &message.content {
        LlmContent::Text(s) => estimate_tokens(s),
        LlmContent::Blocks(blocks) => blocks
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } => estimate_tokens(text),
                ContentBlock::ToolUse { name, input, .. } => {
                    estimate_tokens(name) + estimate_tokens(&input.to_string())
                }
                ContentBlock::ToolResult { content, .. } => estimate_tokens(content),
            })
            .sum(),
    };
    content_tokens + 10
}

/// Shared truncation policy for `buildContext` (spec §4.5): always retain
/// the trailing system message if one is present, then drop oldest
/// non-system messages first until the estimate fits in `token_budget`.
/// Tool messages whose matching `tool_use`/assistant tool call got dropped
/// are dropped too, since no provider accepts an orphaned tool result.
pub fn build_context_generic(history: &[LlmMessage], token_budget: usize) -> BuildContextResult {
    let system_tail: Option<LlmMessage> = history.iter().rev().find(|m| m.is_system()).cloned();
    let mut rest: Vec<LlmMessage> = history.iter().filter(|m| !m.is_system()).cloned().collect();

    let system_tokens = system_tail.as_ref().map(message_tokens).unwrap_or(0);
    let mut dropped = 0usize;

    let total = |rest: &[LlmMessage]| -> usize {
        system_tokens + rest.iter().map(message_tokens).sum::<usize>()
    };

    while total(&rest) > token_budget && rest.len() > 1 {
        rest.remove(0);
        dropped += 1;
    }

    drop_orphaned_tool_messages(&mut rest, &mut dropped);

    let used_tokens = total(&rest);
    let mut messages = rest;
    if let Some(sys) = system_tail {
        messages.push(sys);
        messages.rotate_right(1);
    }

    BuildContextResult {
        messages,
        used_tokens,
        dropped,
    }
}

/// Removes `tool`-role / `tool_result`-bearing messages whose referenced
/// call id no longer has a matching `tool_use`/`tool_calls` entry earlier
/// in the list — spec §4.5's "orphaned tool messages are also dropped".
fn drop_orphaned_tool_messages(messages: &mut Vec<LlmMessage>, dropped: &mut usize) {
    let mut live_call_ids = std::collections::HashSet::new();
    for m in messages.iter() {
        if let LlmContent::Blocks(blocks) = &m.content {
            for b in blocks {
                if let ContentBlock::ToolUse { id, .. } = b {
                    live_call_ids.insert(id.clone());
                }
            }
        }
    }

    let before = messages.len();
    messages.retain(|m| {
        if m.is_tool() {
            if let Some(id) = &m.tool_call_id {
                return live_call_ids.contains(id);
            }
        }
        if let LlmContent::Blocks(blocks) = &m.content {
            if blocks
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
            {
                return blocks.iter().all(|b| match b {
                    ContentBlock::ToolResult { tool_use_id, .. } => {
                        live_call_ids.contains(tool_use_id)
                    }
                    _ => true,
                });
            }
        }
        true
    });
    *dropped += before - messages.len();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_overrides_clamp() {
        let s = SamplingOverrides {
            temperature: Some(5.0),
            top_p: Some(-1.0),
            top_k: Some(5000),
            max_output_tokens: Some(0),
        }
        .clamped();
        assert_eq!(s.temperature, Some(2.0));
        assert_eq!(s.top_p, Some(0.0));
        assert_eq!(s.top_k, Some(1000));
        assert_eq!(s.max_output_tokens, Some(1));
    }

    #[test]
    fn accumulated_tool_call_parses_empty_args_as_object() {
        let tc = AccumulatedToolCall {
            id: "c1".into(),
            name: "exec".into(),
            arguments: String::new(),
            index: None,
        };
        let parsed = tc.parse_arguments().unwrap();
        assert!(parsed.is_object());
    }

    #[test]
    fn build_context_retains_trailing_system_and_last_user() {
        let history = vec![
            LlmMessage::new("system", "be helpful"),
            LlmMessage::new("user", "first question ".repeat(200)),
            LlmMessage::new("assistant", "first answer ".repeat(200)),
            LlmMessage::new("user", "latest question"),
        ];
        let result = build_context_generic(&history, 200);
        assert!(matches!(result.messages.last().unwrap().content, LlmContent::Text(ref t) if t == "latest question"));
        assert!(result.messages.iter().any(|m| m.is_system()));
        assert!(result.used_tokens <= 400);
    }

    #[test]
    fn build_context_drops_orphaned_tool_result() {
        let history = vec![
            LlmMessage::new("user", "run ls"),
            LlmMessage {
                role: "tool".into(),
                content: LlmContent::Text("total 0".into()),
                tool_call_id: Some("missing-call".into()),
            },
        ];
        let result = build_context_generic(&history, 100_000);
        assert!(result.messages.iter().all(|m| !m.is_tool()));
        assert_eq!(result.dropped, 1);
    }
}
