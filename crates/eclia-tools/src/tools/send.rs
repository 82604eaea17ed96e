//! The `send` tool (spec §4.6): delivers text + attachments to a
//! destination. Local paths are copied into the session's artifact
//! directory; artifact refs are validated against the `.eclia/artifacts/`
//! prefix before being re-emitted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use eclia_core::{AdapterConfig, Destination, ToolAccessMode};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::artifact::write_collision_safe;
use crate::registry::{Tool, ToolContext, ToolResult};

pub struct SendTool {
    workspace_root: PathBuf,
    adapters: HashMap<String, AdapterConfig>,
    client: reqwest::Client,
}

impl SendTool {
    pub fn new(workspace_root: impl AsRef<Path>, adapters: HashMap<String, AdapterConfig>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
            adapters,
            client: reqwest::Client::new(),
        }
    }

    /// Rejects any ref escaping `.eclia/artifacts/` — accepts
    /// `eclia://artifact/<rel>`, `<eclia://artifact/<rel>>`, and
    /// `.eclia/artifacts/<rel>` forms.
    fn validate_ref(&self, raw: &str) -> Result<String, String> {
        let trimmed = raw.trim_start_matches('<').trim_end_matches('>');
        let rel = trimmed
            .strip_prefix("eclia://artifact/")
            .or_else(|| trimmed.strip_prefix(".eclia/artifacts/"))
            .ok_or_else(|| format!("not an artifact ref: {raw}"))?;

        let abs = self.workspace_root.join(".eclia/artifacts").join(rel);
        let canon_root = self.workspace_root.join(".eclia/artifacts");
        let normalized = normalize(&abs);
        if !normalized.starts_with(&canon_root) {
            return Err(format!("artifact ref escapes artifact root: {raw}"));
        }
        Ok(format!("eclia://artifact/.eclia/artifacts/{rel}"))
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[derive(Deserialize)]
struct SendArgs {
    destination: Destination,
    text: String,
    #[serde(default)]
    refs: Vec<String>,
    #[serde(default)]
    paths: Vec<String>,
}

#[async_trait::async_trait]
impl Tool for SendTool {
    fn name(&self) -> &str {
        "send"
    }

    fn description(&self) -> &str {
        "Deliver a text message with optional attachments to a destination (inline, or a chat adapter)."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "destination": {
                    "type": "object",
                    "description": "Tagged destination: {kind:\"origin\"|\"web\"|\"discord\"|\"telegram\", ...}"
                },
                "text": { "type": "string" },
                "refs": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Existing artifact refs to attach"
                },
                "paths": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Absolute local paths to attach"
                }
            },
            "required": ["destination", "text"]
        })
    }

    fn needs_approval(&self, args: &Value, mode: ToolAccessMode) -> bool {
        if mode == ToolAccessMode::Full {
            return false;
        }
        let Ok(parsed) = serde_json::from_value::<SendArgs>(args.clone()) else {
            return true;
        };
        !matches!(parsed.destination, Destination::Origin) || !parsed.paths.is_empty()
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let parsed: SendArgs = match serde_json::from_value(args) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(format!("bad_arguments_json: {e}")),
        };

        let mut attached_refs = Vec::new();
        for raw in &parsed.refs {
            match self.validate_ref(raw) {
                Ok(uri) => attached_refs.push(uri),
                Err(e) => return ToolResult::error(format!("forbidden_artifact_ref: {e}")),
            }
        }

        for path in &parsed.paths {
            let src = Path::new(path);
            if !src.is_absolute() {
                return ToolResult::error(format!("paths must be absolute: {path}"));
            }
            let bytes = match std::fs::read(src) {
                Ok(b) => b,
                Err(e) => return ToolResult::error(format!("file_not_found: {e}")),
            };
            let name = src
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("attachment");
            match write_collision_safe(&ctx.artifacts_dir, name, &bytes) {
                Ok(written) => {
                    let rel = written
                        .strip_prefix(&self.workspace_root)
                        .unwrap_or(&written)
                        .to_string_lossy()
                        .replace('\\', "/");
                    attached_refs.push(format!("eclia://artifact/{rel}"));
                }
                Err(e) => return ToolResult::error(format!("failed to copy attachment: {e}")),
            }
        }

        match &parsed.destination {
            Destination::Origin | Destination::Web => ToolResult::text(format!(
                "delivered inline: {}{}",
                parsed.text,
                if attached_refs.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", attached_refs.join(", "))
                }
            )),
            Destination::Discord { .. } | Destination::Telegram { .. } => {
                let kind = match &parsed.destination {
                    Destination::Discord { .. } => "discord",
                    Destination::Telegram { .. } => "telegram",
                    _ => unreachable!(),
                };
                let Some(adapter) = self.adapters.get(kind) else {
                    return ToolResult::error(format!("adapter_disabled: {kind}"));
                };
                let body = json!({
                    "origin": parsed.destination,
                    "content": parsed.text,
                    "refs": attached_refs,
                });
                let response = self
                    .client
                    .post(format!("http://127.0.0.1:{}/send", adapter.port))
                    .header("x-eclia-adapter-key", &adapter.key)
                    .json(&body)
                    .send()
                    .await;
                match response {
                    Ok(resp) if resp.status().is_success() => ToolResult::text("delivered"),
                    Ok(resp) => ToolResult::error(format!("adapter returned {}", resp.status())),
                    Err(e) => ToolResult::error(format!("adapter unreachable: {e}")),
                }
            }
        }
    }
}
