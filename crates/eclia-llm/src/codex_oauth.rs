//! Codex OAuth provider (spec §4.5): JSON-RPC over a local child "Codex
//! app-server" process. Login bootstraps via `account/login/start
//! {type:"chatgpt"}` returning `{authUrl, loginId}`; the child is kept
//! alive until `account/login/completed` arrives for that `loginId` or a
//! 10-minute timeout elapses, then reaped. Chat requests forward to the
//! app-server's streaming method.
//!
//! Grounded on the line-framed JSON-RPC child-process pattern in
//! `eclia-mcp`'s stdio client, generalized with a login bootstrap since
//! no example in the pack implements an OAuth device-code-style flow.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eclia_core::ProviderKind;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::provider::{DeltaSink, LlmError, LlmResult, UpstreamProvider};
use crate::types::{AccumulatedToolCall, ContentBlock, LlmContent, LlmMessage, StreamTurnOutput, StreamTurnRequest};

const LOGIN_TIMEOUT: Duration = Duration::from_secs(600);

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<LlmResult<serde_json::Value>>>>;

async fn dispatch_line(pending: &PendingMap, line: &str) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return;
    };
    let Some(id) = value.get("id").and_then(|v| v.as_u64()) else {
        return;
    };
    let mut guard = pending.lock().await;
    let Some(tx) = guard.remove(&id) else {
        return;
    };
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("codex app-server error")
            .to_string();
        let _ = tx.send(Err(LlmError::RequestFailed(message)));
    } else {
        let _ = tx.send(Ok(value.get("result").cloned().unwrap_or(serde_json::Value::Null)));
    }
}

/// Result of bootstrapping a login flow: the URL to send the user to, and
/// the id the orchestrator polls/awaits completion for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginStart {
    pub auth_url: String,
    pub login_id: String,
}

/// A spawned Codex app-server child, speaking newline-delimited JSON-RPC.
pub struct CodexOauthProvider {
    command: String,
    args: Vec<String>,
    next_id: AtomicU64,
    pending: Arc<PendingMap>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
}

impl CodexOauthProvider {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
        }
    }

    async fn ensure_spawned(&self) -> LlmResult<()> {
        if self.child.lock().await.is_some() {
            return Ok(());
        }

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LlmError::RequestFailed(format!("spawn codex app-server: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LlmError::RequestFailed("codex app-server has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LlmError::RequestFailed("codex app-server has no stdout".to_string()))?;

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        let pending = self.pending.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            loop {
                match reader.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        dispatch_line(&pending, &line).await;
                    }
                    Ok(None) => {
                        debug!("codex app-server stdout closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "codex app-server read error");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    async fn call_raw(&self, method: &str, params: serde_json::Value) -> LlmResult<serde_json::Value> {
        self.ensure_spawned().await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut line = serde_json::to_string(&request)
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        line.push('\n');

        {
            let mut guard = self.stdin.lock().await;
            let stdin = guard
                .as_mut()
                .ok_or_else(|| LlmError::RequestFailed("codex app-server stdin gone".to_string()))?;
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| LlmError::RequestFailed(format!("write to codex app-server: {e}")))?;
        }

        rx.await
            .map_err(|_| LlmError::RequestFailed("codex app-server closed before replying".to_string()))?
    }

    /// Starts a login flow; the caller is expected to present `auth_url` to
    /// the user and then call `await_login_completed`.
    pub async fn login_start(&self) -> LlmResult<LoginStart> {
        let value = self
            .call_raw("account/login/start", serde_json::json!({ "type": "chatgpt" }))
            .await?;
        serde_json::from_value(value).map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }

    /// Waits for `account/login/completed` for `login_id`, or the 10-minute
    /// timeout, then reaps the child either way.
    pub async fn await_login_completed(&self, login_id: &str) -> LlmResult<bool> {
        let result = tokio::time::timeout(LOGIN_TIMEOUT, self.poll_login_completed(login_id)).await;
        self.reap().await;
        match result {
            Ok(inner) => inner,
            Err(_) => Ok(false),
        }
    }

    async fn poll_login_completed(&self, login_id: &str) -> LlmResult<bool> {
        loop {
            let value = self
                .call_raw(
                    "account/login/completed",
                    serde_json::json!({ "loginId": login_id }),
                )
                .await?;
            if let Some(done) = value.get("completed").and_then(|v| v.as_bool()) {
                if done {
                    return Ok(true);
                }
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    async fn reap(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        self.stdin.lock().await.take();
    }
}

#[async_trait::async_trait]
impl UpstreamProvider for CodexOauthProvider {
    fn origin(&self) -> ProviderKind {
        ProviderKind::CodexOauth
    }

    fn supports_model(&self, model: &str) -> bool {
        model.starts_with("gpt-") || model == "codex"
    }

    async fn stream_turn(
        &self,
        request: StreamTurnRequest,
        cancel: CancellationToken,
        on_delta: Option<DeltaSink>,
    ) -> LlmResult<StreamTurnOutput> {
        self.ensure_spawned().await?;

        let params = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "system": request.system,
        });

        let call = self.call_raw("chat/stream", params);
        let value = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            result = call => result?,
        };

        let text = value
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if let Some(tx) = &on_delta {
            if !text.is_empty() {
                let _ = tx.send(text.clone());
            }
        }

        let tool_calls = value
            .get("toolCalls")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|tc| {
                        Some(AccumulatedToolCall {
                            id: tc.get("id")?.as_str()?.to_string(),
                            name: tc.get("name")?.as_str()?.to_string(),
                            arguments: tc.get("arguments").map(|v| v.to_string()).unwrap_or_default(),
                            index: None,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(StreamTurnOutput {
            assistant_text: text,
            tool_calls,
            finish_reason: value
                .get("finishReason")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supports_model_matches_gpt_and_codex() {
        let p = CodexOauthProvider::new("codex-app-server", vec![]);
        assert!(p.supports_model("gpt-5"));
        assert!(p.supports_model("codex"));
        assert!(!p.supports_model("claude-opus-4-6"));
    }

    #[test]
    fn origin_is_codex_oauth() {
        let p = CodexOauthProvider::new("codex-app-server", vec![]);
        assert_eq!(p.origin(), ProviderKind::CodexOauth);
    }
}
