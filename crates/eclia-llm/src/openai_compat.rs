//! OpenAI-compatible chat-completions provider (spec §4.5): POSTs to
//! `<baseURL>/chat/completions` with `stream: true`, accumulates
//! `choices[0].delta.content` and the index-keyed
//! `choices[0].delta.tool_calls[i].function`, and terminates on
//! `finish_reason` / the `[DONE]` sentinel.

use std::collections::BTreeMap;

use eclia_core::ProviderKind;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::provider::{DeltaSink, LlmError, LlmResult, UpstreamProvider};
use crate::types::{
    AccumulatedToolCall, ContentBlock, LlmContent, LlmMessage, StreamTurnOutput, StreamTurnRequest,
};

pub struct OpenAiCompatProvider {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiCompatProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn to_wire_message(m: &LlmMessage) -> WireMessage {
        WireMessage {
            role: m.role.clone(),
            content: Some(m.text()),
            tool_call_id: m.tool_call_id.clone(),
            tool_calls: match &m.content {
                LlmContent::Blocks(blocks) => {
                    let calls: Vec<WireToolCall> = blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::ToolUse { id, name, input } => Some(WireToolCall {
                                id: id.clone(),
                                r#type: "function".to_string(),
                                function: WireFunctionCall {
                                    name: name.clone(),
                                    arguments: input.to_string(),
                                },
                            }),
                            _ => None,
                        })
                        .collect();
                    if calls.is_empty() {
                        None
                    } else {
                        Some(calls)
                    }
                }
                LlmContent::Text(_) => None,
            },
        }
    }
}

#[async_trait::async_trait]
impl UpstreamProvider for OpenAiCompatProvider {
    fn origin(&self) -> ProviderKind {
        ProviderKind::OpenaiCompat
    }

    fn supports_model(&self, _model: &str) -> bool {
        // OpenAI-compatible endpoints are backed by arbitrary model catalogs
        // (local inference servers, third-party routers); any model string
        // is accepted and left to the upstream to reject.
        true
    }

    async fn stream_turn(
        &self,
        request: StreamTurnRequest,
        cancel: CancellationToken,
        on_delta: Option<DeltaSink>,
    ) -> LlmResult<StreamTurnOutput> {
        let mut messages: Vec<WireMessage> = Vec::new();
        if let Some(system) = &request.system {
            messages.push(WireMessage {
                role: "system".to_string(),
                content: Some(system.clone()),
                tool_call_id: None,
                tool_calls: None,
            });
        }
        messages.extend(request.messages.iter().map(Self::to_wire_message));

        let body = ChatCompletionRequest {
            model: request.model.clone(),
            messages,
            stream: true,
            temperature: request.sampling.temperature,
            top_p: request.sampling.top_p,
            max_tokens: request.sampling.max_output_tokens,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(
                    request
                        .tools
                        .iter()
                        .map(|t| WireTool {
                            r#type: "function".to_string(),
                            function: WireFunctionDef {
                                name: t.name.clone(),
                                description: t.description.clone(),
                                parameters: t.input_schema.clone(),
                            },
                        })
                        .collect(),
                )
            },
        };

        debug!(model = %body.model, endpoint = %self.endpoint(), "openai-compat request");

        let mut req = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            result = req.send() => result?,
        };

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return match status.as_u16() {
                401 | 403 => Err(LlmError::AuthFailed(error_text)),
                429 => Err(LlmError::RateLimited {
                    retry_after_ms: 60_000,
                }),
                code => Err(LlmError::upstream_http(code, &error_text)),
            };
        }

        let mut byte_stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut output = StreamTurnOutput::default();
        let mut tool_calls_by_index: BTreeMap<usize, AccumulatedToolCall> = BTreeMap::new();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                next = byte_stream.next() => match next {
                    None => break,
                    Some(Err(e)) => return Err(LlmError::NetworkError(e)),
                    Some(Ok(chunk)) => chunk,
                },
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim_end_matches('\r').to_string();
                buffer = buffer[line_end + 1..].to_string();

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    buffer.clear();
                    break;
                }
                if data.is_empty() {
                    continue;
                }

                let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
                    Ok(c) => c,
                    Err(e) => {
                        return Err(LlmError::InvalidResponse(e.to_string()));
                    }
                };

                let Some(choice) = chunk.choices.into_iter().next() else {
                    continue;
                };

                if let Some(text) = choice.delta.content {
                    if !text.is_empty() {
                        output.assistant_text.push_str(&text);
                        if let Some(tx) = &on_delta {
                            let _ = tx.send(text);
                        }
                    }
                }

                for tc_delta in choice.delta.tool_calls.unwrap_or_default() {
                    let entry = tool_calls_by_index
                        .entry(tc_delta.index)
                        .or_insert_with(|| AccumulatedToolCall {
                            id: String::new(),
                            name: String::new(),
                            arguments: String::new(),
                            index: Some(tc_delta.index),
                        });
                    if let Some(id) = tc_delta.id {
                        entry.id = id;
                    }
                    if let Some(function) = tc_delta.function {
                        if let Some(name) = function.name {
                            entry.name = name;
                        }
                        if let Some(args) = function.arguments {
                            entry.arguments.push_str(&args);
                        }
                    }
                }

                if let Some(reason) = choice.finish_reason {
                    output.finish_reason = Some(reason);
                }
            }
        }

        output.tool_calls = tool_calls_by_index.into_values().collect();
        Ok(output)
    }

    fn build_assistant_tool_call_message(
        &self,
        assistant_text: Option<&str>,
        tool_calls: &[AccumulatedToolCall],
    ) -> LlmMessage {
        let blocks: Vec<ContentBlock> = std::iter::once(assistant_text.filter(|t| !t.is_empty()))
            .flatten()
            .map(|t| ContentBlock::Text { text: t.to_string() })
            .chain(tool_calls.iter().map(|tc| ContentBlock::ToolUse {
                id: tc.id.clone(),
                name: tc.name.clone(),
                input: tc.parse_arguments().unwrap_or(serde_json::Value::Null),
            }))
            .collect();
        LlmMessage::new("assistant", LlmContent::Blocks(blocks))
    }

    fn build_tool_result_message(
        &self,
        tool_call_id: &str,
        _tool_name: &str,
        content: &str,
        _is_error: bool,
    ) -> LlmMessage {
        LlmMessage {
            role: "tool".to_string(),
            content: LlmContent::Text(content.to_string()),
            tool_call_id: Some(tool_call_id.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "max_tokens")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Serialize)]
struct WireToolCall {
    id: String,
    r#type: String,
    function: WireFunctionCall,
}

#[derive(Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct WireTool {
    r#type: String,
    function: WireFunctionDef,
}

#[derive(Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ChunkToolCallDelta>>,
}

#[derive(Deserialize)]
struct ChunkToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<ChunkFunctionDelta>,
}

#[derive(Deserialize)]
struct ChunkFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_wire_message_preserves_tool_call_id() {
        let msg = LlmMessage {
            role: "tool".into(),
            content: LlmContent::Text("ok".into()),
            tool_call_id: Some("call-1".into()),
        };
        let wire = OpenAiCompatProvider::to_wire_message(&msg);
        assert_eq!(wire.tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(wire.content.as_deref(), Some("ok"));
    }

    #[test]
    fn supports_model_accepts_anything() {
        let p = OpenAiCompatProvider::new("http://localhost:1234/v1", None);
        assert!(p.supports_model("anything-goes"));
    }

    #[test]
    fn build_tool_result_message_uses_tool_role() {
        let p = OpenAiCompatProvider::new("http://localhost:1234/v1", None);
        let msg = p.build_tool_result_message("call-1", "exec", "output", false);
        assert_eq!(msg.role, "tool");
        assert_eq!(msg.tool_call_id.as_deref(), Some("call-1"));
    }
}
