//! Upstream LLM provider adapters with streaming support.

pub mod anthropic;
pub mod codex_oauth;
pub mod openai_compat;
pub mod provider;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use codex_oauth::CodexOauthProvider;
pub use eclia_core::ProviderKind;
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{DeltaSink, LlmError, LlmResult, UpstreamProvider};
pub use types::*;
