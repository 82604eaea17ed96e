//! Stdio MCP client for the exec tool host (§4.4).
//!
//! Grounded on sblanchard's `mcp-client::transport::StdioTransport` (spawn,
//! line-framed read/write, alive flag) and `manager.rs`'s handshake
//! sequence (`initialize` → `notifications/initialized` → `tools/list`),
//! collapsed to a single server since ECLIA has exactly one tool host, and
//! extended with the `__eclia` call envelope and a lame-duck state that
//! fails *all* outstanding requests on child exit — the teacher only fails
//! the current one.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eclia_core::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};

use crate::protocol::{
    initialize_params, JsonRpcNotification, JsonRpcRequest, McpToolDef, ToolCallResult,
    ToolsListResult,
};

const MAX_SKIP_LINES: usize = 1000;

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value>>>>;

/// Long-lived child process speaking newline-delimited JSON-RPC 2.0.
pub struct McpStdioClient {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    next_id: AtomicU64,
    alive: AtomicBool,
    pending: PendingMap,
    tool_schema: Mutex<Vec<McpToolDef>>,
    write_lock: Mutex<()>,
}

impl McpStdioClient {
    /// Spawns the child, completes the `initialize`/`initialized` handshake,
    /// and fetches the advertised tool schema.
    pub async fn spawn(command: &str, args: &[String]) -> Result<Arc<Self>> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(Error::Io)?;

        let stdin = child.stdin.take().ok_or_else(|| {
            Error::Internal("toolhost child has no stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::Internal("toolhost child has no stdout".to_string())
        })?;

        let client = Arc::new(Self {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            pending: Mutex::new(HashMap::new()),
            tool_schema: Mutex::new(Vec::new()),
            write_lock: Mutex::new(()),
        });

        client.clone().spawn_reader(stdout);
        client.handshake().await?;
        Ok(client)
    }

    fn spawn_reader(self: Arc<Self>, stdout: ChildStdout) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut skipped = 0usize;
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break, // EOF: child exited.
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() || !trimmed.starts_with('{') {
                            skipped += 1;
                            if skipped > MAX_SKIP_LINES {
                                tracing::warn!("toolhost emitted too much non-JSON output, giving up");
                                break;
                            }
                            continue;
                        }
                        skipped = 0;
                        self.dispatch_line(trimmed).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "toolhost stdout read error");
                        break;
                    }
                }
            }
            self.enter_lame_duck().await;
        });
    }

    async fn dispatch_line(&self, line: &str) {
        match serde_json::from_str::<crate::protocol::JsonRpcResponse>(line) {
            Ok(resp) => {
                let mut pending = self.pending.lock().await;
                if let Some(tx) = pending.remove(&resp.id) {
                    let result = resp.into_result().map_err(|e| {
                        Error::ToolhostBadResult(e.to_string())
                    });
                    let _ = tx.send(result);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, line, "failed to parse toolhost response line");
            }
        }
    }

    /// Fails every outstanding request and flips the lame-duck flag so
    /// future `call_tool` calls fail fast without writing to stdin.
    async fn enter_lame_duck(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(Error::ToolhostError("toolhost gone".to_string())));
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::ToolhostError("toolhost is in lame-duck state".to_string()));
        }
        let _guard = self.write_lock.lock().await;
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);
        let line = serde_json::to_string(&req)?;

        let rx = {
            let mut pending = self.pending.lock().await;
            let (tx, rx) = oneshot::channel();
            pending.insert(id, tx);
            rx
        };

        self.write_line(&line).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ToolhostError("toolhost reply channel closed".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                let _ = self
                    .notify(
                        "notifications/cancelled",
                        Some(serde_json::json!({ "requestId": id })),
                    )
                    .await;
                Err(Error::ToolhostTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        let notif = JsonRpcNotification::new(method, params);
        let line = serde_json::to_string(&notif)?;
        self.write_line(&line).await
    }

    async fn handshake(&self) -> Result<()> {
        let params = serde_json::to_value(initialize_params())?;
        let result = self
            .request("initialize", Some(params), Duration::from_secs(30))
            .await?;
        tracing::debug!(?result, "toolhost initialize complete");

        self.notify("notifications/initialized", None).await?;

        match self
            .request("tools/list", None, Duration::from_secs(30))
            .await
        {
            Ok(value) => {
                let parsed: ToolsListResult = serde_json::from_value(value)?;
                *self.tool_schema.lock().await = parsed.tools;
            }
            Err(e) => {
                tracing::warn!(error = %e, "toolhost tools/list failed, continuing with no tools");
            }
        }
        Ok(())
    }

    pub async fn tool_schema(&self) -> Vec<McpToolDef> {
        self.tool_schema.lock().await.clone()
    }

    /// Calls `name` with `args`, embedding the `__eclia` envelope so the
    /// host can scope its artifact directory to this session/call.
    pub async fn call_tool(
        &self,
        name: &str,
        args: serde_json::Value,
        session_id: &str,
        call_id: &str,
        timeout: Duration,
    ) -> Result<ToolCallResult> {
        let mut merged = match args {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        merged.insert(
            "__eclia".to_string(),
            serde_json::json!({ "sessionId": session_id, "callId": call_id }),
        );

        let params = serde_json::json!({ "name": name, "arguments": merged });
        let value = self.request("tools/call", Some(params), timeout).await?;
        let result: ToolCallResult = serde_json::from_value(value)
            .map_err(|e| Error::ToolhostBadResult(e.to_string()))?;
        Ok(result)
    }

    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.shutdown().await;
        }
        let mut child = self.child.lock().await;
        let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
        let _ = child.start_kill();
    }
}
