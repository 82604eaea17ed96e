//! Hermetic integration tests for the chat orchestrator: no network calls,
//! no live upstream credentials — a scripted fake provider stands in for
//! the real adapters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use eclia_agent::{ChatOrchestrator, ChatRequest, RouteResolver};
use eclia_approval::ApprovalHub;
use eclia_core::{ProviderKind, Role, StreamMode, ToolAccessMode, TranscriptRecord};
use eclia_llm::{
    AccumulatedToolCall, DeltaSink, LlmError, LlmMessage, LlmResult, StreamTurnOutput,
    StreamTurnRequest, UpstreamProvider,
};
use eclia_session::{SessionLock, SessionStore};
use eclia_tools::{Tool, ToolContext, ToolRegistry, ToolResult};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// Upstream stand-in that plays back a scripted sequence of turn outputs,
/// one per call to `stream_turn`. The last scripted output repeats once
/// exhausted, so a test can under-specify trailing no-op turns.
struct ScriptedProvider {
    script: Mutex<Vec<StreamTurnOutput>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(script: Vec<StreamTurnOutput>) -> Self {
        Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamProvider for ScriptedProvider {
    fn origin(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    async fn stream_turn(
        &self,
        _request: StreamTurnRequest,
        _cancel: CancellationToken,
        on_delta: Option<DeltaSink>,
    ) -> LlmResult<StreamTurnOutput> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap();
        let output = script
            .get(index)
            .or_else(|| script.last())
            .cloned()
            .ok_or_else(|| LlmError::RequestFailed("empty script".into()))?;

        if let Some(tx) = on_delta {
            let _ = tx.send(output.assistant_text.clone());
        }
        Ok(output)
    }

    fn build_assistant_tool_call_message(
        &self,
        assistant_text: Option<&str>,
        _tool_calls: &[AccumulatedToolCall],
    ) -> LlmMessage {
        LlmMessage::new("assistant", assistant_text.unwrap_or_default())
    }

    fn build_tool_result_message(
        &self,
        _tool_call_id: &str,
        _tool_name: &str,
        content: &str,
        _is_error: bool,
    ) -> LlmMessage {
        LlmMessage::new("user", content)
    }
}

/// A tool that always succeeds, echoing its arguments back.
struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "echoes its arguments"
    }
    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }
    fn needs_approval(&self, _args: &Value, _mode: ToolAccessMode) -> bool {
        false
    }
    async fn invoke(&self, args: Value, _ctx: &ToolContext) -> ToolResult {
        ToolResult::text(args.to_string())
    }
}

/// A tool that always needs approval under `Safe` mode.
struct DangerousTool;

#[async_trait]
impl Tool for DangerousTool {
    fn name(&self) -> &str {
        "dangerous"
    }
    fn description(&self) -> &str {
        "requires approval"
    }
    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }
    fn needs_approval(&self, _args: &Value, mode: ToolAccessMode) -> bool {
        mode == ToolAccessMode::Safe
    }
    async fn invoke(&self, _args: Value, _ctx: &ToolContext) -> ToolResult {
        ToolResult::text("boom")
    }
}

fn harness(
    dir: &std::path::Path,
    provider: Arc<dyn UpstreamProvider>,
    tools: ToolRegistry,
) -> (ChatOrchestrator, Arc<ApprovalHub>, Arc<SessionStore>) {
    let store = Arc::new(SessionStore::new(dir));
    let lock = Arc::new(SessionLock::new());
    let approvals = Arc::new(ApprovalHub::new());
    let mut routes = RouteResolver::new().with_default_provider(ProviderKind::Anthropic);
    routes.register("anthropic:default", provider, "claude-sonnet-4-20250514");

    let orchestrator = ChatOrchestrator::new(
        store.clone(),
        lock,
        approvals.clone(),
        Arc::new(tools),
        Arc::new(routes),
        Vec::new(),
    );
    (orchestrator, approvals, store)
}

fn chat_request(text: &str) -> ChatRequest {
    serde_json::from_value(json!({
        "sessionId": "s1",
        "model": "anthropic:default",
        "userText": text,
    }))
    .unwrap()
}

#[tokio::test]
async fn no_tool_calls_terminates_immediately_and_persists_transcript() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![StreamTurnOutput {
        assistant_text: "hello there".into(),
        tool_calls: vec![],
        finish_reason: Some("stop".into()),
    }]));
    let (orchestrator, _approvals, store) = harness(dir.path(), provider.clone(), ToolRegistry::new());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    orchestrator
        .handle_chat(chat_request("hi"), CancellationToken::new(), tx)
        .await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events.first(), Some(eclia_agent::ChatEvent::Meta { .. })));
    assert!(matches!(events.last(), Some(eclia_agent::ChatEvent::Done { .. })));
    assert_eq!(provider.call_count(), 1);

    let transcript = store.read_transcript("s1").unwrap();
    let has_user = transcript
        .records
        .iter()
        .any(|r| matches!(r, TranscriptRecord::Message { role: Role::User, .. }));
    let has_assistant = transcript
        .records
        .iter()
        .any(|r| matches!(r, TranscriptRecord::Message { role: Role::Assistant, .. }));
    assert!(has_user);
    assert!(has_assistant);
}

#[tokio::test]
async fn tool_call_without_approval_executes_and_feeds_result_back() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        StreamTurnOutput {
            assistant_text: "calling echo".into(),
            tool_calls: vec![AccumulatedToolCall {
                id: "call-1".into(),
                name: "echo".into(),
                arguments: r#"{"value":"hi"}"#.into(),
                index: None,
            }],
            finish_reason: Some("tool_calls".into()),
        },
        StreamTurnOutput {
            assistant_text: "done".into(),
            tool_calls: vec![],
            finish_reason: Some("stop".into()),
        },
    ]));
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    let (orchestrator, _approvals, store) = harness(dir.path(), provider.clone(), tools);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    orchestrator
        .handle_chat(chat_request("use echo"), CancellationToken::new(), tx)
        .await;

    let mut saw_tool_result_ok = false;
    while let Ok(event) = rx.try_recv() {
        if let eclia_agent::ChatEvent::ToolResult { ok, .. } = event {
            saw_tool_result_ok = ok;
        }
    }
    assert!(saw_tool_result_ok);
    assert_eq!(provider.call_count(), 2);

    let transcript = store.read_transcript("s1").unwrap();
    let tool_record = transcript
        .records
        .iter()
        .find(|r| matches!(r, TranscriptRecord::Message { role: Role::Tool, .. }));
    assert!(tool_record.is_some());
}

#[tokio::test]
async fn approval_required_tool_waits_then_runs_after_decide() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        StreamTurnOutput {
            assistant_text: "calling dangerous".into(),
            tool_calls: vec![AccumulatedToolCall {
                id: "call-1".into(),
                name: "dangerous".into(),
                arguments: "{}".into(),
                index: None,
            }],
            finish_reason: Some("tool_calls".into()),
        },
        StreamTurnOutput {
            assistant_text: "done".into(),
            tool_calls: vec![],
            finish_reason: Some("stop".into()),
        },
    ]));
    let mut tools = ToolRegistry::new();
    tools.register(DangerousTool);
    let (orchestrator, approvals, _store) = harness(dir.path(), provider, tools);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handle = tokio::spawn({
        let approvals = approvals.clone();
        async move {
            loop {
                let pending = approvals.pending_for_session("s1").await;
                if let Some(ticket) = pending.into_iter().next() {
                    approvals
                        .decide(&ticket.approval_id, eclia_core::ApprovalDecision::Approve)
                        .await
                        .unwrap();
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        }
    });

    orchestrator
        .handle_chat(chat_request("use dangerous"), CancellationToken::new(), tx)
        .await;
    handle.await.unwrap();

    let mut saw_pending_approval = false;
    let mut tool_ok = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            eclia_agent::ChatEvent::ToolCall { approval: Some(_), .. } => saw_pending_approval = true,
            eclia_agent::ChatEvent::ToolResult { ok, .. } => tool_ok = ok,
            _ => {}
        }
    }
    assert!(saw_pending_approval);
    assert!(tool_ok);
}

#[tokio::test]
async fn final_stream_mode_suppresses_deltas_and_emits_single_final_event() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![StreamTurnOutput {
        assistant_text: "the answer".into(),
        tool_calls: vec![],
        finish_reason: Some("stop".into()),
    }]));
    let (orchestrator, _approvals, _store) = harness(dir.path(), provider, ToolRegistry::new());

    let mut request = chat_request("question");
    request.stream_mode = StreamMode::Final;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    orchestrator.handle_chat(request, CancellationToken::new(), tx).await;

    let mut saw_delta = false;
    let mut final_count = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            eclia_agent::ChatEvent::Delta { .. } => saw_delta = true,
            eclia_agent::ChatEvent::Final { .. } => final_count += 1,
            _ => {}
        }
    }
    assert!(!saw_delta);
    assert_eq!(final_count, 1);
}

#[test]
fn validate_rejects_invalid_session_id_before_locking() {
    let dir = tempfile::tempdir().unwrap();
    let provider: Arc<dyn UpstreamProvider> = Arc::new(ScriptedProvider::new(vec![]));
    let (orchestrator, _approvals, _store) = harness(dir.path(), provider, ToolRegistry::new());
    let mut request = chat_request("hi");
    request.session_id = "not a valid id!".to_string();
    assert!(orchestrator.validate(&request).is_err());
}
