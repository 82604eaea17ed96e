//! `UpstreamProvider` — the polymorphic capability set spec §4.5 describes:
//! `buildContext`, `streamTurn`, `buildAssistantToolCallMessage`,
//! `buildToolResultMessage`, and `origin`. A process-global registry maps
//! provider scheme to constructor (spec §9: "no inheritance").

use std::pin::Pin;

use eclia_core::ProviderKind;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::{AccumulatedToolCall, BuildContextResult, LlmMessage, StreamTurnRequest, StreamTurnOutput};

/// Result type for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;

/// LLM error types
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("upstream http error: status={status} body={body_snippet:?}")]
    UpstreamHttp { status: u16, body_snippet: String },

    #[error("context overflow: {0}")]
    ContextOverflow(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl LlmError {
    /// Truncates the upstream response body to the 240-char snippet spec
    /// §4.5 mandates for `UpstreamHTTP{status, body-snippet}`.
    pub fn upstream_http(status: u16, body: &str) -> Self {
        let snippet: String = body.chars().take(240).collect();
        Self::UpstreamHttp {
            status,
            body_snippet: snippet,
        }
    }
}

/// Sink for progressive text deltas while a turn streams — forwarded by the
/// orchestrator as SSE `delta{text}` events when stream mode is `full`.
pub type DeltaSink = mpsc::UnboundedSender<String>;

pub type LlmStream = Pin<Box<dyn futures::Stream<Item = LlmResult<crate::types::StreamDelta>> + Send>>;

/// Capability set an upstream adapter must implement (spec §4.5). One
/// concrete type per provider scheme: OpenAI-compatible, Anthropic Messages,
/// Codex OAuth.
#[async_trait::async_trait]
pub trait UpstreamProvider: Send + Sync {
    /// Provider scheme this instance serves — used by the route-key
    /// resolver and to pick the model-id default.
    fn origin(&self) -> ProviderKind;

    fn supports_model(&self, model: &str) -> bool;

    /// Truncated, schema-appropriate message list plus a used-token
    /// estimate and drop count (spec §4.5). The generic byte-based
    /// heuristic in `types::build_context_generic` is correct for every
    /// provider today; a provider overrides this only if its wire schema
    /// needs a different truncation shape.
    fn build_context(&self, history: &[LlmMessage], token_budget: usize) -> BuildContextResult {
        crate::types::build_context_generic(history, token_budget)
    }

    /// Streams one upstream turn. Must honor `cancel` promptly (tear down
    /// the HTTP stream) and surface HTTP/network errors per spec §4.5.
    /// `on_delta`, when present, receives progressive assistant text.
    async fn stream_turn(
        &self,
        request: StreamTurnRequest,
        cancel: CancellationToken,
        on_delta: Option<DeltaSink>,
    ) -> LlmResult<StreamTurnOutput>;

    /// Builds the assistant message (with embedded tool calls) to append to
    /// the provider-agnostic transcript after a turn that produced tool
    /// calls.
    fn build_assistant_tool_call_message(
        &self,
        assistant_text: Option<&str>,
        tool_calls: &[AccumulatedToolCall],
    ) -> LlmMessage;

    /// Builds the message that feeds a tool's result back into the next
    /// iteration's messages.
    fn build_tool_result_message(
        &self,
        tool_call_id: &str,
        tool_name: &str,
        content: &str,
        is_error: bool,
    ) -> LlmMessage;
}
