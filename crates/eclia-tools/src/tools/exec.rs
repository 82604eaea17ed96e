//! The `exec` tool (spec §4.6): routes shell execution through the MCP tool
//! host rather than spawning a child process directly. Allowlisted commands
//! skip approval in safe mode; everything else needs a human decision.
//! Large or binary output is sanitized before it reaches the model or UI.

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use eclia_core::{AllowlistRule, ToolAccessMode};
use eclia_mcp::McpStdioClient;
use serde_json::{json, Value};
use std::sync::Arc;

use tracing::debug;

use crate::artifact::{build_artifact_meta, write_collision_safe};
use crate::registry::{Tool, ToolContext, ToolResult};

const MAX_TEXT_CHARS: usize = 30_000;
const MAX_TOOL_TIMEOUT_MS: u64 = 3_600_000;

pub struct ExecTool {
    client: Arc<McpStdioClient>,
    allowlist: Vec<AllowlistRule>,
    default_timeout_ms: u64,
    workspace_root: std::path::PathBuf,
}

impl ExecTool {
    pub fn new(
        client: Arc<McpStdioClient>,
        allowlist: Vec<AllowlistRule>,
        default_timeout_ms: u64,
        workspace_root: impl AsRef<Path>,
    ) -> Self {
        Self {
            client,
            allowlist,
            default_timeout_ms,
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }

    fn is_allowlisted(&self, cmd: &str, call_args: &[String]) -> bool {
        is_allowlisted(&self.allowlist, cmd, call_args)
    }
}

fn is_allowlisted(allowlist: &[AllowlistRule], cmd: &str, call_args: &[String]) -> bool {
    allowlist.iter().any(|rule| rule.matches(cmd, call_args))
}

fn parse_args(args: &Value) -> Vec<String> {
    args.get("args")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command via the sandboxed tool host. Captures stdout and stderr."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "cmd": { "type": "string", "description": "The command to run" },
                "args": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Arguments to the command"
                },
                "timeoutMs": {
                    "type": "integer",
                    "description": "Timeout in milliseconds, clamped to 1 hour"
                }
            },
            "required": ["cmd"]
        })
    }

    fn needs_approval(&self, args: &Value, mode: ToolAccessMode) -> bool {
        if mode == ToolAccessMode::Full {
            return false;
        }
        let cmd = args.get("cmd").and_then(|v| v.as_str()).unwrap_or("");
        !self.is_allowlisted(cmd, &parse_args(args))
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let Some(cmd) = args.get("cmd").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: cmd");
        };
        let call_args = args.get("args").cloned().unwrap_or(json!([]));

        let timeout_ms = args
            .get("timeoutMs")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.default_timeout_ms)
            .min(MAX_TOOL_TIMEOUT_MS);

        let payload = json!({ "cmd": cmd, "args": call_args });

        debug!(cmd, timeout_ms, call_id = %ctx.call_id, "exec tool call");

        let result = match self
            .client
            .call_tool(
                "exec",
                payload,
                &ctx.session_id,
                &ctx.call_id,
                Duration::from_millis(timeout_ms),
            )
            .await
        {
            Ok(r) => r,
            Err(e) => return ToolResult::error(e.to_string()),
        };

        let mut text_parts = Vec::new();
        let mut artifacts = Vec::new();

        for item in &result.content {
            match item.content_type.as_str() {
                "text" => {
                    if let Some(t) = &item.text {
                        text_parts.push(t.clone());
                    }
                }
                other => {
                    if let Some(encoded) = &item.text {
                        match BASE64.decode(encoded) {
                            Ok(bytes) => {
                                let dir = ctx.artifacts_dir.clone();
                                let name = format!("output.{}", extension_for(other));
                                match write_collision_safe(&dir, &name, &bytes) {
                                    Ok(path) => match build_artifact_meta(&self.workspace_root, &path, &bytes) {
                                        Ok(meta) => artifacts.push(meta),
                                        Err(e) => text_parts.push(format!("[artifact metadata failed: {e}]")),
                                    },
                                    Err(e) => text_parts.push(format!("[failed to write artifact: {e}]")),
                                }
                            }
                            Err(_) => text_parts.push(format!("[{other} content omitted]")),
                        }
                    }
                }
            }
        }

        let mut combined = text_parts.join("\n");
        if combined.chars().count() > MAX_TEXT_CHARS {
            let truncated: String = combined.chars().take(MAX_TEXT_CHARS).collect();
            combined = format!("{truncated}\n... [truncated, {} total chars]", combined.chars().count());
        }
        if !artifacts.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&artifacts.iter().map(|a| a.ref_.as_str()).collect::<Vec<_>>().join("\n"));
        }
        if combined.is_empty() {
            combined = "(no output)".to_string();
        }

        if result.is_error {
            ToolResult::error(combined)
        } else {
            ToolResult::text_with_artifacts(combined, artifacts)
        }
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image" => "png",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_prefix_rule_matches() {
        let rules = vec![AllowlistRule::Prefix {
            match_prefix: "git".to_string(),
            args: None,
        }];
        assert!(is_allowlisted(&rules, "git", &["status".to_string()]));
        assert!(!is_allowlisted(&rules, "rm", &["-rf".to_string(), "/".to_string()]));
    }

    #[test]
    fn allowlist_rule_scoped_to_specific_args_rejects_other_invocations() {
        let rules = vec![AllowlistRule::Exact {
            match_exact: "git".to_string(),
            args: Some(vec!["status".to_string()]),
        }];
        assert!(is_allowlisted(&rules, "git", &["status".to_string()]));
        assert!(!is_allowlisted(&rules, "git", &["push".to_string(), "--force".to_string()]));
    }

    #[test]
    fn extension_for_image_is_png() {
        assert_eq!(extension_for("image"), "png");
        assert_eq!(extension_for("audio"), "bin");
    }
}
