//! Wire shapes for `POST /api/chat` (spec §6) and the event stream the
//! orchestrator emits internally (spec §4.7). Kept provider-agnostic and
//! transport-agnostic: `eclia-gateway` is responsible for framing
//! [`ChatEvent`] as SSE.

use eclia_core::{Destination, Origin, StreamMode, ToolAccessMode};
use eclia_llm::SamplingOverrides;
use serde::{Deserialize, Serialize};

/// Body of `POST /api/chat`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub session_id: String,
    /// Route key (`<scheme>:<profileId>`), NOT an upstream model id.
    pub model: String,
    pub user_text: String,
    #[serde(default)]
    pub context_token_limit: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub tool_access_mode: ToolAccessMode,
    #[serde(default)]
    pub enabled_tools: Option<Vec<String>>,
    #[serde(default)]
    pub stream_mode: StreamMode,
    #[serde(default)]
    pub origin: Option<Origin>,
}

impl ChatRequest {
    pub fn sampling(&self) -> SamplingOverrides {
        SamplingOverrides {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            max_output_tokens: self.max_output_tokens,
        }
        .clamped()
    }
}

/// Summary of one tool call persisted/emitted alongside `assistant_end`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallSummary {
    pub call_id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// Present on a `tool_call` event only when the call requires a human
/// decision before it runs.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalInfo {
    pub approval_id: String,
}

/// One SSE-bound event. `eclia-gateway` serializes these as
/// `event: <tag>\ndata: <json>\n\n`.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChatEvent {
    Meta {
        session_id: String,
        model: String,
        used_tokens: usize,
    },
    AssistantStart,
    Delta {
        text: String,
    },
    AssistantEnd {
        text: String,
        tool_calls: Vec<ToolCallSummary>,
    },
    ToolCall {
        call_id: String,
        name: String,
        args: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        approval: Option<ApprovalInfo>,
    },
    ToolResult {
        call_id: String,
        name: String,
        ok: bool,
        result: serde_json::Value,
    },
    Final {
        text: String,
    },
    Error {
        kind: String,
        message: String,
    },
    Done {
        reason: String,
    },
}

/// Destination-carrying helper kept here since `ChatRequest.origin` and the
/// `send` tool's `Destination` share the same tagged-origin shape — not
/// used directly by the orchestrator but re-exported for gateway callers
/// that need to translate one into the other.
pub fn origin_as_destination(origin: &Origin) -> Option<Destination> {
    match origin {
        Origin::Web => Some(Destination::Web),
        Origin::Discord { channel, .. } => channel.clone().map(|channel| Destination::Discord { channel }),
        Origin::Telegram { chat_id, .. } => chat_id.clone().map(|chat_id| Destination::Telegram { chat_id }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_deserializes_with_defaults() {
        let json = serde_json::json!({
            "sessionId": "s1",
            "model": "anthropic:default",
            "userText": "hi",
        });
        let req: ChatRequest = serde_json::from_value(json).unwrap();
        assert_eq!(req.tool_access_mode, ToolAccessMode::Safe);
        assert_eq!(req.stream_mode, StreamMode::Full);
        assert!(req.enabled_tools.is_none());
    }

    #[test]
    fn origin_as_destination_requires_channel() {
        let origin = Origin::Discord {
            guild: None,
            channel: None,
            thread: None,
        };
        assert!(origin_as_destination(&origin).is_none());
    }
}
