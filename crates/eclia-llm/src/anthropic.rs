//! Anthropic Messages API provider (spec §4.5): POSTs to `<baseURL>/v1/messages`,
//! converts the provider-agnostic transcript into Anthropic's
//! `{role, content[]}` blocks, and reads `content_block_delta` SSE events.

use eclia_core::ProviderKind;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::provider::{DeltaSink, LlmError, LlmResult, UpstreamProvider};
use crate::types::{
    AccumulatedToolCall, ContentBlock, LlmContent, LlmMessage, StreamDelta, StreamTurnOutput,
    StreamTurnRequest, Usage,
};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn to_wire_message(m: &LlmMessage) -> AnthropicMessage {
        AnthropicMessage {
            role: if m.role == "tool" {
                "user".to_string()
            } else {
                m.role.clone()
            },
            content: match &m.content {
                LlmContent::Text(s) => serde_json::json!(s),
                LlmContent::Blocks(blocks) => serde_json::to_value(blocks).unwrap_or_default(),
            },
        }
    }
}

#[async_trait::async_trait]
impl UpstreamProvider for AnthropicProvider {
    fn origin(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn supports_model(&self, model: &str) -> bool {
        model.starts_with("claude-")
    }

    async fn stream_turn(
        &self,
        request: StreamTurnRequest,
        cancel: CancellationToken,
        on_delta: Option<DeltaSink>,
    ) -> LlmResult<StreamTurnOutput> {
        let sampling = request.sampling.clone();
        let body = AnthropicRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(Self::to_wire_message).collect(),
            max_tokens: sampling.max_output_tokens.unwrap_or(8192),
            stream: true,
            system: request.system.clone(),
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(
                    request
                        .tools
                        .iter()
                        .map(|t| AnthropicTool {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            input_schema: t.input_schema.clone(),
                        })
                        .collect(),
                )
            },
        };

        debug!(model = %body.model, "anthropic request");

        let send = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            result = send => result?,
        };

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return match status.as_u16() {
                401 => Err(LlmError::AuthFailed(error_text)),
                429 => Err(LlmError::RateLimited {
                    retry_after_ms: 60_000,
                }),
                code => Err(LlmError::upstream_http(code, &error_text)),
            };
        }

        let mut stream = parse_sse_stream(response.bytes_stream());
        tokio::pin!(stream);

        let mut output = StreamTurnOutput::default();
        let mut current_tool: Option<AccumulatedToolCall> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                delta = stream.next() => {
                    match delta {
                        None => break,
                        Some(Err(e)) => return Err(e),
                        Some(Ok(StreamDelta::Text(text))) => {
                            output.assistant_text.push_str(&text);
                            if let Some(tx) = &on_delta {
                                let _ = tx.send(text);
                            }
                        }
                        Some(Ok(StreamDelta::ToolCallStart { id, name })) => {
                            current_tool = Some(AccumulatedToolCall {
                                id,
                                name,
                                arguments: String::new(),
                                index: None,
                            });
                        }
                        Some(Ok(StreamDelta::ToolCallDelta { arguments, .. })) => {
                            if let Some(tool) = current_tool.as_mut() {
                                tool.arguments.push_str(&arguments);
                            }
                        }
                        Some(Ok(StreamDelta::ToolCallEnd { .. })) => {
                            if let Some(tool) = current_tool.take() {
                                output.tool_calls.push(tool);
                            }
                        }
                        Some(Ok(StreamDelta::Done { stop_reason, .. })) => {
                            output.finish_reason = stop_reason;
                        }
                        Some(Ok(StreamDelta::Thinking(_))) => {}
                        Some(Ok(StreamDelta::Error(msg))) => return Err(LlmError::StreamError(msg)),
                    }
                }
            }
        }

        if !output.tool_calls.is_empty() && output.finish_reason.as_deref() != Some("tool_use") {
            output.finish_reason = Some("tool_use".to_string());
        }

        Ok(output)
    }

    fn build_assistant_tool_call_message(
        &self,
        assistant_text: Option<&str>,
        tool_calls: &[AccumulatedToolCall],
    ) -> LlmMessage {
        let mut blocks = Vec::new();
        if let Some(text) = assistant_text {
            if !text.is_empty() {
                blocks.push(ContentBlock::Text {
                    text: text.to_string(),
                });
            }
        }
        for tc in tool_calls {
            blocks.push(ContentBlock::ToolUse {
                id: tc.id.clone(),
                name: tc.name.clone(),
                input: tc.parse_arguments().unwrap_or(serde_json::Value::Null),
            });
        }
        LlmMessage::new("assistant", LlmContent::Blocks(blocks))
    }

    fn build_tool_result_message(
        &self,
        tool_call_id: &str,
        _tool_name: &str,
        content: &str,
        is_error: bool,
    ) -> LlmMessage {
        // Anthropic expects tool_result blocks nested in a user-role message.
        LlmMessage::new(
            "user",
            LlmContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: tool_call_id.to_string(),
                content: content.to_string(),
                is_error: Some(is_error),
            }]),
        )
    }
}

fn parse_sse_stream(
    bytes_stream: impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
) -> impl futures::Stream<Item = LlmResult<StreamDelta>> + Send {
    async_stream::stream! {
        let mut buffer = String::new();
        let mut current_tool_id: Option<String> = None;

        tokio::pin!(bytes_stream);

        while let Some(chunk_result) = bytes_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    yield Err(LlmError::StreamError(e.to_string()));
                    continue;
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(event_end) = buffer.find("\n\n") {
                let event_str = buffer[..event_end].to_string();
                buffer = buffer[event_end + 2..].to_string();

                let mut event_type = String::new();
                let mut event_data = String::new();

                for line in event_str.lines() {
                    if let Some(rest) = line.strip_prefix("event: ") {
                        event_type = rest.to_string();
                    } else if let Some(rest) = line.strip_prefix("data: ") {
                        event_data = rest.to_string();
                    }
                }

                if event_data.is_empty() { continue; }

                match event_type.as_str() {
                    "content_block_start" => {
                        if let Ok(data) = serde_json::from_str::<ContentBlockStart>(&event_data) {
                            match data.content_block {
                                ContentBlockType::ToolUse { id, name } => {
                                    current_tool_id = Some(id.clone());
                                    yield Ok(StreamDelta::ToolCallStart { id, name });
                                }
                                ContentBlockType::Text { .. } => {}
                            }
                        }
                    }
                    "content_block_delta" => {
                        if let Ok(data) = serde_json::from_str::<ContentBlockDelta>(&event_data) {
                            match data.delta {
                                DeltaType::TextDelta { text } => {
                                    yield Ok(StreamDelta::Text(text));
                                }
                                DeltaType::ThinkingDelta { thinking } => {
                                    yield Ok(StreamDelta::Thinking(thinking));
                                }
                                DeltaType::InputJsonDelta { partial_json } => {
                                    if let Some(id) = &current_tool_id {
                                        yield Ok(StreamDelta::ToolCallDelta {
                                            id: id.clone(),
                                            arguments: partial_json,
                                        });
                                    }
                                }
                            }
                        }
                    }
                    "content_block_stop" => {
                        if let Some(id) = current_tool_id.take() {
                            yield Ok(StreamDelta::ToolCallEnd { id });
                        }
                    }
                    "message_delta" => {
                        if let Ok(data) = serde_json::from_str::<MessageDelta>(&event_data) {
                            if let Some(stop_reason) = data.delta.stop_reason {
                                debug!(stop_reason, "anthropic message_delta");
                            }
                        }
                    }
                    "message_stop" => {
                        yield Ok(StreamDelta::Done {
                            stop_reason: Some("end_turn".to_string()),
                            usage: None,
                        });
                    }
                    "error" => {
                        if let Ok(data) = serde_json::from_str::<ErrorEvent>(&event_data) {
                            yield Err(LlmError::StreamError(data.error.message));
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: String,
    content: serde_json::Value,
}

#[derive(Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Deserialize)]
struct ContentBlockStart {
    #[allow(dead_code)]
    index: u32,
    content_block: ContentBlockType,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlockType {
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
    #[serde(rename = "text")]
    #[allow(dead_code)]
    Text { text: String },
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    #[allow(dead_code)]
    index: u32,
    delta: DeltaType,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum DeltaType {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaContent,
    #[allow(dead_code)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct MessageDeltaContent {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[allow(dead_code)]
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supports_model_matches_claude_prefix() {
        let p = AnthropicProvider::new("fake");
        assert!(p.supports_model("claude-opus-4-6-20250929"));
        assert!(!p.supports_model("gpt-4o"));
    }

    #[test]
    fn build_assistant_tool_call_message_has_text_then_tool_use() {
        let p = AnthropicProvider::new("fake");
        let tc = AccumulatedToolCall {
            id: "c1".into(),
            name: "exec".into(),
            arguments: r#"{"cmd":"ls"}"#.into(),
            index: None,
        };
        let msg = p.build_assistant_tool_call_message(Some("running ls"), &[tc]);
        match msg.content {
            LlmContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert!(matches!(blocks[0], ContentBlock::Text { .. }));
                assert!(matches!(blocks[1], ContentBlock::ToolUse { .. }));
            }
            _ => panic!("expected blocks"),
        }
    }

    #[test]
    fn build_tool_result_message_is_user_role_with_tool_result_block() {
        let p = AnthropicProvider::new("fake");
        let msg = p.build_tool_result_message("c1", "exec", "ok", false);
        assert_eq!(msg.role, "user");
        match msg.content {
            LlmContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 1);
                match &blocks[0] {
                    ContentBlock::ToolResult { tool_use_id, .. } => assert_eq!(tool_use_id, "c1"),
                    _ => panic!("expected tool_result"),
                }
            }
            _ => panic!("expected blocks"),
        }
    }
}
