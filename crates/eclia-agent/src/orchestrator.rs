//! Turn Orchestrator (spec §4.7): `handleChat`, the multi-iteration
//! stream-then-tool loop. Grounded on the teacher's
//! `AgentRuntime::run_turn_cancellable` (cancellable streaming loop,
//! `tokio::select!` race against a `CancellationToken`, accumulation of
//! `AccumulatedToolCall`s), generalized from one hardcoded
//! `AnthropicProvider` + in-memory `Session` to the polymorphic
//! `UpstreamProvider` trait plus the on-disk `SessionStore`/`SessionLock`,
//! with SSE-bound [`ChatEvent`]s replacing the teacher's `AgentEvent`
//! channel and an approval-wait step spliced into the tool-execution arm.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use eclia_approval::ApprovalHub;
use eclia_core::{
    is_valid_session_id, ApprovalDecision, Error, Origin, Result as CoreResult, Role, StreamMode,
    ToolAccessMode, ToolCall as CoreToolCall, TranscriptRecord,
};
use eclia_llm::{
    AccumulatedToolCall, LlmMessage, LlmTool, SamplingOverrides, StreamTurnRequest, UpstreamProvider,
};
use eclia_session::{SessionLock, SessionStore};
use eclia_tools::{ToolContext, ToolRegistry, ToolResult as ToolInvokeResult};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::{ApprovalInfo, ChatEvent, ChatRequest, ToolCallSummary};
use crate::fallback::try_fallback_parse_tool_calls;
use crate::route::RouteResolver;
use crate::system::SystemInstructionSource;

const DEFAULT_TOKEN_BUDGET: usize = 180_000;
const APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_TOOL_ITERATIONS: usize = 25;

/// Everything the orchestrator needs to run one chat turn, constructed once
/// per gateway process and shared across sessions.
pub struct ChatOrchestrator {
    store: Arc<SessionStore>,
    lock: Arc<SessionLock>,
    approvals: Arc<ApprovalHub>,
    tools: Arc<ToolRegistry>,
    routes: Arc<RouteResolver>,
    system_sources: Vec<Arc<dyn SystemInstructionSource>>,
    max_tool_iterations: usize,
    /// Debug toggle for the plaintext tool-call fallback parser.
    fallback_parser_enabled: bool,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<SessionStore>,
        lock: Arc<SessionLock>,
        approvals: Arc<ApprovalHub>,
        tools: Arc<ToolRegistry>,
        routes: Arc<RouteResolver>,
        system_sources: Vec<Arc<dyn SystemInstructionSource>>,
    ) -> Self {
        Self {
            store,
            lock,
            approvals,
            tools,
            routes,
            system_sources,
            max_tool_iterations: MAX_TOOL_ITERATIONS,
            fallback_parser_enabled: false,
        }
    }

    pub fn with_fallback_parser(mut self, enabled: bool) -> Self {
        self.fallback_parser_enabled = enabled;
        self
    }

    /// Pre-lock validation (spec §4.7: "Validates the request... Acquires
    /// the session lock and then runs"). Returns a plain `Result` so the
    /// gateway can answer with an HTTP 4xx before ever opening the SSE
    /// response.
    pub fn validate(&self, request: &ChatRequest) -> CoreResult<()> {
        if !is_valid_session_id(&request.session_id) {
            return Err(Error::invalid_request(format!(
                "invalid session id: {}",
                request.session_id
            )));
        }
        if request.user_text.trim().is_empty() {
            return Err(Error::invalid_request("userText must not be empty"));
        }
        if request.model.trim().is_empty() {
            return Err(Error::invalid_request("model (route key) must not be empty"));
        }
        Ok(())
    }

    /// Runs the full turn, emitting [`ChatEvent`]s to `tx` as it goes.
    /// Assumes [`Self::validate`] already passed. Never returns an `Err` —
    /// every failure mode is represented as an `error`/`done` event pair so
    /// the session's stored state stays consistent regardless of outcome.
    pub async fn handle_chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
        tx: UnboundedSender<ChatEvent>,
    ) {
        let session_id = request.session_id.clone();
        self.lock
            .with_session_lock(&session_id, &cancel, || self.run_turn(request, cancel.clone(), tx))
            .await;
    }

    async fn run_turn(&self, request: ChatRequest, cancel: CancellationToken, tx: UnboundedSender<ChatEvent>) {
        let session_id = request.session_id.clone();

        // --- 1. Hydrate ---
        let seed_title = derive_title(&request);
        if let Err(e) = self
            .store
            .ensure_session(&session_id, seed_title, request.origin.clone())
        {
            emit(&tx, ChatEvent::Meta { session_id, model: request.model.clone(), used_tokens: 0 });
            emit(&tx, error_event(&e.to_string(), "session_not_found"));
            emit(&tx, ChatEvent::Done { reason: "error".into() });
            return;
        }

        if let Some(origin) = &request.origin {
            let _ = self.store.update_meta(&session_id, |meta| {
                let compatible = meta.origin.as_ref().map(|o| o.same_kind(origin)).unwrap_or(true);
                if compatible {
                    meta.origin = Some(origin.clone());
                }
            });
        }

        let stored = match self.store.read_transcript(&session_id) {
            Ok(s) => s,
            Err(e) => {
                emit(&tx, ChatEvent::Meta { session_id, model: request.model.clone(), used_tokens: 0 });
                emit(&tx, error_event(&e.to_string(), e.kind()));
                emit(&tx, ChatEvent::Done { reason: "error".into() });
                return;
            }
        };

        // --- 2. Append user message ---
        let now = Utc::now();
        let user_record = TranscriptRecord::message(Role::User, request.user_text.clone(), now);
        if let Err(e) = self.store.append_transcript(&session_id, &user_record) {
            emit(&tx, ChatEvent::Meta { session_id, model: request.model.clone(), used_tokens: 0 });
            emit(&tx, error_event(&e.to_string(), e.kind()));
            emit(&tx, ChatEvent::Done { reason: "error".into() });
            return;
        }

        // --- 3. Resolve backend ---
        let selection = match self.routes.resolve(&request.model) {
            Ok(s) => s,
            Err(e) => {
                emit(&tx, ChatEvent::Meta { session_id: session_id.clone(), model: request.model.clone(), used_tokens: 0 });
                emit(&tx, error_event(&e.to_string(), "upstream_network"));
                let err_record = TranscriptRecord::message(
                    Role::Assistant,
                    format!("[route resolution failed: {e}]"),
                    Utc::now(),
                );
                let _ = self.store.append_transcript(&session_id, &err_record);
                let _ = self.store.append_turn(&session_id, Uuid::new_v4().to_string(), request.model.clone(), 0, 0);
                emit(&tx, ChatEvent::Done { reason: "error".into() });
                return;
            }
        };

        // --- 4. Build system instruction ---
        let system = crate::system::build_system_instruction(&self.system_sources);

        // --- 5. Budget context ---
        let mut history = transcript_to_llm_messages(&stored.records, selection.provider.as_ref());
        history.push(LlmMessage::new("user", request.user_text.clone()));
        let token_budget = request.context_token_limit.unwrap_or(DEFAULT_TOKEN_BUDGET);
        let built = selection.provider.build_context(&history, token_budget);
        let mut messages = built.messages;

        // --- 6. Open SSE ---
        emit(
            &tx,
            ChatEvent::Meta {
                session_id: session_id.clone(),
                model: selection.route_key.clone(),
                used_tokens: built.used_tokens,
            },
        );

        let tool_definitions: Vec<LlmTool> = self
            .tools
            .get_definitions(request.enabled_tools.as_deref());
        let sampling: SamplingOverrides = request.sampling();
        let stream_mode = request.stream_mode;

        let used_tokens = built.used_tokens;
        let mut final_error: Option<String> = None;
        let mut iterations = 0usize;

        // --- 7. Tool loop ---
        loop {
            if cancel.is_cancelled() {
                break;
            }
            iterations += 1;
            if iterations > self.max_tool_iterations {
                final_error = Some("max tool iterations exceeded".to_string());
                break;
            }

            if stream_mode == StreamMode::Full {
                emit(&tx, ChatEvent::AssistantStart);
            }

            let on_delta = if stream_mode == StreamMode::Full {
                let (delta_tx, mut delta_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
                let forward_tx = tx.clone();
                tokio::spawn(async move {
                    while let Some(text) = delta_rx.recv().await {
                        emit(&forward_tx, ChatEvent::Delta { text });
                    }
                });
                Some(delta_tx)
            } else {
                None
            };

            let stream_request = StreamTurnRequest {
                model: selection.upstream_model_id.clone(),
                messages: messages.clone(),
                tools: tool_definitions.clone(),
                system: system.clone(),
                sampling: sampling.clone(),
            };

            let output = match selection
                .provider
                .stream_turn(stream_request, cancel.clone(), on_delta)
                .await
            {
                Ok(o) => o,
                Err(e) => {
                    final_error = Some(e.to_string());
                    let err_record = TranscriptRecord::message(
                        Role::Assistant,
                        format!("[provider error: {e}]"),
                        Utc::now(),
                    );
                    let _ = self.store.append_transcript(&session_id, &err_record);
                    emit(&tx, error_event(&e.to_string(), "upstream_network"));
                    break;
                }
            };

            let mut tool_calls = output.tool_calls;

            if tool_calls.is_empty() && self.fallback_parser_enabled {
                if let Some(reason) = &output.finish_reason {
                    if reason == "tool_calls" {
                        if let Some(parsed) = try_fallback_parse_tool_calls(&output.assistant_text) {
                            record_fallback_warning(&self.store, &session_id, &output.assistant_text);
                            tool_calls = parsed;
                        }
                    }
                }
            }

            // --- 7b. Persist assistant message ---
            let core_tool_calls: Vec<CoreToolCall> = tool_calls
                .iter()
                .map(|tc| CoreToolCall {
                    call_id: tc.id.clone(),
                    name: tc.name.clone(),
                    args_raw: tc.arguments.clone(),
                    index: tc.index,
                })
                .collect();
            let assistant_record = if core_tool_calls.is_empty() {
                TranscriptRecord::message(Role::Assistant, output.assistant_text.clone(), Utc::now())
            } else {
                TranscriptRecord::assistant_with_tool_calls(
                    output.assistant_text.clone(),
                    core_tool_calls,
                    Utc::now(),
                )
            };
            let _ = self.store.append_transcript(&session_id, &assistant_record);

            let summaries: Vec<ToolCallSummary> = tool_calls
                .iter()
                .map(|tc| ToolCallSummary {
                    call_id: tc.id.clone(),
                    name: tc.name.clone(),
                    args: tc.parse_arguments().unwrap_or(Value::Null),
                })
                .collect();
            if stream_mode == StreamMode::Full {
                emit(
                    &tx,
                    ChatEvent::AssistantEnd {
                        text: output.assistant_text.clone(),
                        tool_calls: summaries,
                    },
                );
            }

            messages.push(
                selection
                    .provider
                    .build_assistant_tool_call_message(
                        if output.assistant_text.is_empty() { None } else { Some(&output.assistant_text) },
                        &tool_calls,
                    ),
            );

            // --- 7c. No tool calls: terminal ---
            if tool_calls.is_empty() {
                if stream_mode == StreamMode::Final {
                    emit(&tx, ChatEvent::Final { text: output.assistant_text.clone() });
                }
                break;
            }

            // --- 7d. Execute each tool call in order ---
            for tc in &tool_calls {
                if cancel.is_cancelled() {
                    break;
                }
                let args = tc.parse_arguments().unwrap_or(Value::Null);
                let needs_approval = self
                    .tools
                    .needs_approval(&tc.name, &args, request.tool_access_mode);

                let approval_id = if needs_approval {
                    let reason = format!("tool '{}' requires approval", tc.name);
                    Some(self.approvals.enqueue(session_id.clone(), reason, tc.name.clone(), args.clone()))
                } else {
                    None
                };

                if stream_mode == StreamMode::Full {
                    emit(
                        &tx,
                        ChatEvent::ToolCall {
                            call_id: tc.id.clone(),
                            name: tc.name.clone(),
                            args: args.clone(),
                            approval: approval_id.clone().map(|approval_id| ApprovalInfo { approval_id }),
                        },
                    );
                }

                let invoke_result = if let Some(approval_id) = &approval_id {
                    match self.approvals.wait(approval_id, APPROVAL_TIMEOUT).await {
                        Ok(ApprovalDecision::Approve) => {
                            self.invoke_tool(&session_id, tc, args.clone(), &cancel).await
                        }
                        Ok(ApprovalDecision::Deny) => ToolInvokeResult::error("tool call denied by operator"),
                        Ok(ApprovalDecision::Timeout) => ToolInvokeResult::error("approval timed out"),
                        Ok(ApprovalDecision::Cancelled) => ToolInvokeResult::error("approval cancelled"),
                        Err(e) => ToolInvokeResult::error(e.to_string()),
                    }
                } else {
                    self.invoke_tool(&session_id, tc, args.clone(), &cancel).await
                };

                let is_error = invoke_result.is_error();
                let content = invoke_result.to_content_string();
                let artifacts = invoke_result.artifacts();

                if stream_mode == StreamMode::Full {
                    let result = if artifacts.is_empty() {
                        Value::String(content.clone())
                    } else {
                        serde_json::json!({
                            "text": content,
                            "artifacts": artifacts,
                        })
                    };
                    emit(
                        &tx,
                        ChatEvent::ToolResult {
                            call_id: tc.id.clone(),
                            name: tc.name.clone(),
                            ok: !is_error,
                            result,
                        },
                    );
                }

                let tool_record = TranscriptRecord::tool_result(tc.id.clone(), content.clone(), is_error, Utc::now());
                let _ = self.store.append_transcript(&session_id, &tool_record);

                messages.push(
                    selection
                        .provider
                        .build_tool_result_message(&tc.id, &tc.name, &content, is_error),
                );

                if cancel.is_cancelled() {
                    break;
                }
            }
        }

        // --- 8. Close turn ---
        let turn_id = Uuid::new_v4().to_string();
        let _ = self
            .store
            .append_turn(&session_id, turn_id, selection.route_key.clone(), token_budget, used_tokens);
        let _ = self.store.update_meta(&session_id, |meta| {
            meta.last_route_key = Some(selection.route_key.clone());
        });

        if let Some(message) = final_error {
            emit(&tx, error_event(&message, "upstream_network"));
        }

        let reason = if cancel.is_cancelled() {
            "cancelled"
        } else if final_error.is_some() {
            "error"
        } else {
            "complete"
        };
        emit(&tx, ChatEvent::Done { reason: reason.to_string() });
    }

    async fn invoke_tool(
        &self,
        session_id: &str,
        tc: &AccumulatedToolCall,
        args: Value,
        cancel: &CancellationToken,
    ) -> ToolInvokeResult {
        let ctx = ToolContext {
            session_id: session_id.to_string(),
            call_id: tc.id.clone(),
            artifacts_dir: artifacts_dir_for(&self.store, session_id, &tc.id),
            cancel: cancel.clone(),
        };
        self.tools.invoke_cancellable(&tc.name, args, &ctx).await
    }
}

fn artifacts_dir_for(store: &SessionStore, session_id: &str, call_id: &str) -> PathBuf {
    store.artifacts_dir(session_id).join(call_id)
}

fn emit(tx: &UnboundedSender<ChatEvent>, event: ChatEvent) {
    let _ = tx.send(event);
}

fn error_event(message: &str, kind: &str) -> ChatEvent {
    ChatEvent::Error {
        kind: kind.to_string(),
        message: message.to_string(),
    }
}

fn derive_title(request: &ChatRequest) -> Option<String> {
    if let Some(origin) = &request.origin {
        return Some(match origin {
            Origin::Web => "Web session".to_string(),
            Origin::Discord { channel, .. } => format!("Discord: {}", channel.clone().unwrap_or_default()),
            Origin::Telegram { chat_id, .. } => format!("Telegram: {}", chat_id.clone().unwrap_or_default()),
        });
    }
    let trimmed: String = request.user_text.chars().take(60).collect();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Records the fallback-parser warning (spec §4.7) as one ND-JSON line
/// under `<root>/.eclia/debug/<sessionId>/warnings.ndjson`. Best-effort:
/// failures here never abort the turn.
fn record_fallback_warning(store: &SessionStore, session_id: &str, assistant_text: &str) {
    let dir = store.artifacts_dir(session_id).join("..").join("..").join("debug").join(session_id);
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let line = serde_json::json!({
        "sessionId": session_id,
        "timestamp": Utc::now(),
        "warning": "fallback tool-call parser engaged",
        "assistantText": assistant_text,
    });
    if let Ok(mut serialized) = serde_json::to_string(&line) {
        serialized.push('\n');
        use std::io::Write;
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("warnings.ndjson"))
        {
            let _ = file.write_all(serialized.as_bytes());
        }
    }
}

/// Rebuilds the provider-agnostic message list from persisted transcript
/// records, asking the resolved provider to re-encode assistant tool calls
/// and tool results in its own wire shape (spec §4.5 `buildAssistantToolCallMessage`
/// / `buildToolResultMessage`). System records are skipped: the system
/// instruction is composed fresh every turn (step 4), never replayed from
/// the transcript.
fn transcript_to_llm_messages(records: &[TranscriptRecord], provider: &dyn UpstreamProvider) -> Vec<LlmMessage> {
    let mut out = Vec::new();
    for record in records {
        let TranscriptRecord::Message {
            role,
            content,
            tool_calls,
            tool_call_id,
            tool_is_error,
            ..
        } = record
        else {
            continue;
        };

        match role {
            Role::System => continue,
            Role::User => out.push(LlmMessage::new("user", content.clone())),
            Role::Assistant => match tool_calls {
                Some(calls) if !calls.is_empty() => {
                    let accumulated: Vec<AccumulatedToolCall> = calls
                        .iter()
                        .map(|tc| AccumulatedToolCall {
                            id: tc.call_id.clone(),
                            name: tc.name.clone(),
                            arguments: tc.args_raw.clone(),
                            index: tc.index,
                        })
                        .collect();
                    let text = if content.is_empty() { None } else { Some(content.as_str()) };
                    out.push(provider.build_assistant_tool_call_message(text, &accumulated));
                }
                _ => out.push(LlmMessage::new("assistant", content.clone())),
            },
            Role::Tool => {
                if let Some(call_id) = tool_call_id {
                    out.push(provider.build_tool_result_message(
                        call_id,
                        "",
                        content,
                        tool_is_error.unwrap_or(false),
                    ));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use eclia_core::{ProviderKind, Role};
    use eclia_llm::AnthropicProvider;

    fn sample_request() -> ChatRequest {
        ChatRequest {
            session_id: "s1".to_string(),
            model: "anthropic:default".to_string(),
            user_text: "hello there".to_string(),
            context_token_limit: None,
            temperature: None,
            top_p: None,
            top_k: None,
            max_output_tokens: None,
            tool_access_mode: ToolAccessMode::Safe,
            enabled_tools: None,
            stream_mode: StreamMode::Full,
            origin: None,
        }
    }

    fn orchestrator(dir: &std::path::Path) -> ChatOrchestrator {
        let store = Arc::new(SessionStore::new(dir));
        let lock = Arc::new(SessionLock::new());
        let approvals = Arc::new(ApprovalHub::new());
        let tools = Arc::new(ToolRegistry::new());
        let mut routes = RouteResolver::new().with_default_provider(ProviderKind::Anthropic);
        let provider: Arc<dyn UpstreamProvider> = Arc::new(AnthropicProvider::new("test-key"));
        routes.register("anthropic:default", provider, "claude-sonnet-4-20250514");
        ChatOrchestrator::new(store, lock, approvals, tools, Arc::new(routes), Vec::new())
    }

    #[test]
    fn validate_rejects_bad_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let mut req = sample_request();
        req.session_id = "bad id".to_string();
        assert!(orch.validate(&req).is_err());
    }

    #[test]
    fn validate_rejects_empty_text() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let mut req = sample_request();
        req.user_text = "   ".to_string();
        assert!(orch.validate(&req).is_err());
    }

    #[test]
    fn validate_accepts_well_formed_request() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        assert!(orch.validate(&sample_request()).is_ok());
    }

    #[tokio::test]
    async fn unresolvable_route_emits_error_and_done() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let mut req = sample_request();
        req.model = "openai-compat:missing".to_string();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        orch.handle_chat(req, CancellationToken::new(), tx).await;

        let mut saw_error = false;
        let mut saw_done = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                ChatEvent::Error { .. } => saw_error = true,
                ChatEvent::Done { .. } => saw_done = true,
                _ => {}
            }
        }
        assert!(saw_error);
        assert!(saw_done);
    }

    #[test]
    fn transcript_to_llm_messages_skips_system_records() {
        let provider = AnthropicProvider::new("test-key");
        let now = Utc::now();
        let records = vec![
            TranscriptRecord::message(Role::System, "be helpful", now),
            TranscriptRecord::message(Role::User, "hi", now),
        ];
        let messages = transcript_to_llm_messages(&records, &provider);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }
}
