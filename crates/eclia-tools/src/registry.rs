//! Tool trait and registry (spec §4.6).
//!
//! Each tool is a self-contained module implementing the Tool trait.
//! Tools can be added/removed by editing the tools/ directory and
//! create_default_registry() in lib.rs.

use eclia_core::{ArtifactMeta, ToolAccessMode};
use eclia_llm::LlmTool;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub enum ToolResult {
    Text(String),
    TextWithArtifacts(String, Vec<ArtifactMeta>),
    Json(Value),
    Error(String),
}

impl ToolResult {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// A text result that also produced artifacts (spec §3/§4.6 — the
    /// `tool_result` event's `result.artifacts` array).
    pub fn text_with_artifacts(s: impl Into<String>, artifacts: Vec<ArtifactMeta>) -> Self {
        if artifacts.is_empty() {
            Self::Text(s.into())
        } else {
            Self::TextWithArtifacts(s.into(), artifacts)
        }
    }

    pub fn error(s: impl Into<String>) -> Self {
        Self::Error(s.into())
    }

    pub fn to_content_string(&self) -> String {
        match self {
            Self::Text(s) | Self::TextWithArtifacts(s, _) => s.clone(),
            Self::Json(v) => serde_json::to_string_pretty(v).unwrap_or_default(),
            Self::Error(e) => format!("Error: {}", e),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Artifacts produced by this call, if any (spec §3/§4.6).
    pub fn artifacts(&self) -> &[ArtifactMeta] {
        match self {
            Self::TextWithArtifacts(_, artifacts) => artifacts,
            _ => &[],
        }
    }
}

/// Per-call context a tool needs beyond its JSON arguments: where this call's
/// artifacts live, which session/call it belongs to, and the cooperative
/// cancellation token for this turn.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub call_id: String,
    pub artifacts_dir: PathBuf,
    pub cancel: CancellationToken,
}

/// The Tool trait — implement this to add a new capability.
///
/// Each tool is a standalone unit that can be registered with a ToolRegistry.
/// To add a new tool: create a file in tools/, implement this trait, register
/// it in create_default_registry().
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name (e.g. "exec", "send", "web").
    fn name(&self) -> &str;

    /// Human-readable description sent to the LLM.
    fn description(&self) -> &str;

    /// System prompt fragment for this tool (injected into LLM context).
    fn prompt(&self) -> &str {
        ""
    }

    /// JSON Schema for input parameters.
    fn input_schema(&self) -> Value;

    /// Whether this tool only reads state (no side effects).
    fn is_read_only(&self) -> bool {
        false
    }

    /// Whether this tool is currently enabled.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Safe-mode approval policy (spec §4.6): given the call's parsed
    /// arguments, does this call require a human decision before it runs?
    /// Always `false` in `ToolAccessMode::Full`.
    fn needs_approval(&self, args: &Value, mode: ToolAccessMode) -> bool;

    /// Invoke the tool with the given arguments and call context.
    async fn invoke(&self, args: Value, ctx: &ToolContext) -> ToolResult;

    /// Invoke with cancellation support. Default: race invoke() against
    /// cancellation. Tools that manage child processes or outbound
    /// connections should override this to tear those down promptly.
    async fn invoke_cancellable(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        tokio::select! {
            result = self.invoke(args, ctx) => result,
            _ = ctx.cancel.cancelled() => ToolResult::text("[cancelled]"),
        }
    }

    /// Convert to the LLM tool definition format.
    fn to_llm_tool(&self) -> LlmTool {
        LlmTool {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Remove a tool by name.
    pub fn remove(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn needs_approval(&self, name: &str, args: &Value, mode: ToolAccessMode) -> bool {
        match self.tools.get(name) {
            Some(tool) => tool.needs_approval(args, mode),
            None => false,
        }
    }

    pub async fn invoke(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolResult {
        match self.tools.get(name) {
            Some(tool) if tool.is_enabled() => tool.invoke(args, ctx).await,
            Some(_) => ToolResult::Error(format!("Tool '{}' is disabled", name)),
            None => ToolResult::Error(format!("Tool not found: {}", name)),
        }
    }

    /// Invoke a tool with cancellation support.
    pub async fn invoke_cancellable(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolResult {
        match self.tools.get(name) {
            Some(tool) if tool.is_enabled() => tool.invoke_cancellable(args, ctx).await,
            Some(_) => ToolResult::Error(format!("Tool '{}' is disabled", name)),
            None => ToolResult::Error(format!("Tool not found: {}", name)),
        }
    }

    /// Get LLM tool definitions for all enabled tools, optionally filtered
    /// to the names in `enabled_tools` (spec §6 `enabledTools?`).
    pub fn get_definitions(&self, enabled_tools: Option<&[String]>) -> Vec<LlmTool> {
        self.tools
            .values()
            .filter(|t| t.is_enabled())
            .filter(|t| enabled_tools.map(|names| names.iter().any(|n| n == t.name())).unwrap_or(true))
            .map(|t| t.to_llm_tool())
            .collect()
    }

    /// Get system prompt fragments from all enabled tools.
    pub fn combined_prompts(&self) -> String {
        self.tools
            .values()
            .filter(|t| t.is_enabled())
            .map(|t| t.prompt())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// List only read-only tools.
    pub fn list_read_only(&self) -> Vec<&str> {
        self.tools
            .iter()
            .filter(|(_, t)| t.is_read_only())
            .map(|(k, _)| k.as_str())
            .collect()
    }
}
