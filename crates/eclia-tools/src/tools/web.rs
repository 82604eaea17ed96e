//! The `web` tool (spec §4.6): proxies a query to a configured web-search
//! provider. `search` mode is read-only; `extract` mode (fetching and
//! parsing a specific page) is treated as a mutating mode requiring
//! approval in safe mode.

use eclia_core::{ToolAccessMode, WebSearchConfig};
use serde_json::{json, Value};

use crate::registry::{Tool, ToolContext, ToolResult};

pub struct WebTool {
    config: Option<WebSearchConfig>,
    client: reqwest::Client,
}

impl WebTool {
    pub fn new(config: Option<WebSearchConfig>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl Tool for WebTool {
    fn name(&self) -> &str {
        "web"
    }

    fn description(&self) -> &str {
        "Search the web, or extract a specific page's content, via the configured search provider."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "mode": {
                    "type": "string",
                    "enum": ["search", "extract"],
                    "description": "search returns ranked hits; extract fetches one URL's content"
                }
            },
            "required": ["query"]
        })
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn needs_approval(&self, args: &Value, mode: ToolAccessMode) -> bool {
        if mode == ToolAccessMode::Full {
            return false;
        }
        args.get("mode").and_then(|v| v.as_str()) == Some("extract")
    }

    async fn invoke(&self, args: Value, _ctx: &ToolContext) -> ToolResult {
        let Some(query) = args.get("query").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: query");
        };
        let mode = args.get("mode").and_then(|v| v.as_str()).unwrap_or("search");

        let Some(config) = &self.config else {
            return ToolResult::error("web search is not configured");
        };

        let mut request = self
            .client
            .get(&config.endpoint)
            .query(&[("q", query), ("mode", mode)]);

        if let Some(env_var) = &config.api_key_env {
            if let Ok(key) = std::env::var(env_var) {
                request = request.bearer_auth(key);
            }
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                Ok(body) => ToolResult::Json(body),
                Err(e) => ToolResult::error(format!("bad response from search provider: {e}")),
            },
            Ok(resp) => ToolResult::error(format!("search provider returned {}", resp.status())),
            Err(e) => ToolResult::error(format!("search provider unreachable: {e}")),
        }
    }
}
