//! Eclia Tools — the three native tool implementations of spec §4.6
//! (`exec`, `send`, `web`), plus the shared Tool trait and registry.

pub mod artifact;
pub mod registry;
pub mod tools;

pub use registry::{Tool, ToolContext, ToolRegistry, ToolResult};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use eclia_core::{AdapterConfig, AllowlistRule, WebSearchConfig};
use eclia_mcp::McpStdioClient;

/// Registers the three native tools (spec §4.6) against a shared MCP client.
pub fn create_default_registry(
    workspace_root: impl AsRef<Path>,
    exec_client: Arc<McpStdioClient>,
    exec_allowlist: Vec<AllowlistRule>,
    exec_default_timeout_ms: u64,
    adapters: HashMap<String, AdapterConfig>,
    web_search: Option<WebSearchConfig>,
) -> ToolRegistry {
    let root = workspace_root.as_ref();
    let mut registry = ToolRegistry::new();

    registry.register(tools::exec::ExecTool::new(
        exec_client,
        exec_allowlist,
        exec_default_timeout_ms,
        root,
    ));
    registry.register(tools::send::SendTool::new(root, adapters));
    registry.register(tools::web::WebTool::new(web_search));

    registry
}
