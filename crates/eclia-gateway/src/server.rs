//! Gateway server: session CRUD, the streaming chat endpoint, artifact
//! serving, and approval decisions (spec §6), grounded on the teacher's
//! `start_gateway`/axum `Router` wiring but generalized from one WebSocket
//! route backed by a single hardcoded agent runtime to the HTTP/SSE API a
//! multi-provider [`eclia_agent::ChatOrchestrator`] drives.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use eclia_agent::{ChatEvent, ChatOrchestrator, ChatRequest, RouteResolver, StaticSystemPart};
use eclia_approval::ApprovalHub;
use eclia_core::{ApprovalDecision, EcliaConfig, Error, ProviderKind, ProviderProfile};
use eclia_llm::{AnthropicProvider, CodexOauthProvider, OpenAiCompatProvider, UpstreamProvider};
use eclia_mcp::McpStdioClient;
use eclia_session::{SessionLock, SessionStore};
use eclia_tools::create_default_registry;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::artifacts::serve_artifact;
use crate::auth::ResolvedAuth;

pub struct ExtendedConfig {
    pub gateway: EcliaConfig,
    pub workspace_root: PathBuf,
    pub system_prompt: Option<String>,
}

impl Default for ExtendedConfig {
    fn default() -> Self {
        Self {
            gateway: EcliaConfig::default(),
            workspace_root: std::env::current_dir().unwrap_or_default(),
            system_prompt: None,
        }
    }
}

struct GatewayState {
    auth: ResolvedAuth,
    orchestrator: Arc<ChatOrchestrator>,
    store: Arc<SessionStore>,
    lock: Arc<SessionLock>,
    approvals: Arc<ApprovalHub>,
    workspace_root: PathBuf,
    started_at: Instant,
}

pub async fn start_gateway(config: ExtendedConfig) -> anyhow::Result<()> {
    let env_token = std::env::var("ECLIA_GATEWAY_TOKEN").ok();
    let auth = ResolvedAuth::from_config(&config.gateway.auth, env_token);

    let eclia_root = config.workspace_root.join(".eclia");
    let store = Arc::new(SessionStore::new(&eclia_root));
    let lock = Arc::new(SessionLock::new());
    let approvals = Arc::new(ApprovalHub::new());

    let toolhost_cmd = std::env::var("ECLIA_TOOLHOST_CMD").unwrap_or_else(|_| "eclia-toolhost".to_string());
    let exec_client = McpStdioClient::spawn(&toolhost_cmd, &[]).await?;

    let tools = Arc::new(create_default_registry(
        &config.workspace_root,
        exec_client,
        config.gateway.exec.allowlist.clone(),
        config.gateway.exec.default_timeout_ms,
        config.gateway.adapters.clone(),
        config.gateway.web_search.clone(),
    ));
    info!("registered tools: {:?}", tools.list());

    let mut routes = RouteResolver::new().with_default_provider(config.gateway.default_provider_kind());
    for (profile_id, profile) in &config.gateway.providers {
        let route_key = format!("{}:{}", profile.provider.scheme(), profile_id);
        match build_provider(profile) {
            Some(provider) => {
                let default_model = profile.default_model.clone().unwrap_or_default();
                routes.register(route_key, provider, default_model);
            }
            None => warn!(profile = %profile_id, "skipping provider profile with no usable credentials"),
        }
    }

    let mut system_sources = Vec::new();
    if let Some(prompt) = &config.system_prompt {
        system_sources.push(StaticSystemPart::new(0, prompt.clone()));
    }
    system_sources.push(StaticSystemPart::new(10, tools.combined_prompts()));

    let orchestrator = Arc::new(ChatOrchestrator::new(
        store.clone(),
        lock.clone(),
        approvals.clone(),
        tools,
        Arc::new(routes),
        system_sources,
    ));

    let bind_addr: SocketAddr = format!("{}:{}", config.gateway.bind.to_addr(), config.gateway.port)
        .parse()
        .expect("invalid bind address");

    let state = Arc::new(GatewayState {
        auth,
        orchestrator,
        store,
        lock,
        approvals,
        workspace_root: config.workspace_root.clone(),
        started_at: Instant::now(),
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/api/sessions", get(list_sessions_handler).post(create_session_handler))
        .route("/api/sessions/:id", axum::routing::delete(delete_session_handler))
        .route("/api/sessions/:id/reset", post(reset_session_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/artifacts", get(artifacts_handler))
        .route("/api/approvals/:id", post(approval_decision_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state);

    info!("eclia gateway starting");
    info!("  listening on {}", bind_addr);
    info!("  auth mode: {:?}", config.gateway.auth.mode);
    info!("  workspace: {:?}", config.workspace_root);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Instantiates the concrete adapter for a configured profile. Returns
/// `None` if the profile is missing the credentials it needs, so a gateway
/// can start with a partially-configured `providers` table.
fn build_provider(profile: &ProviderProfile) -> Option<Arc<dyn UpstreamProvider>> {
    match profile.provider {
        ProviderKind::Anthropic => {
            let api_key = profile.api_key_env.as_ref().and_then(|v| std::env::var(v).ok())?;
            let mut provider = AnthropicProvider::new(api_key);
            if let Some(base_url) = &profile.base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            Some(Arc::new(provider))
        }
        ProviderKind::OpenaiCompat => {
            let base_url = profile.base_url.clone()?;
            let api_key = profile.api_key_env.as_ref().and_then(|v| std::env::var(v).ok());
            Some(Arc::new(OpenAiCompatProvider::new(base_url, api_key)))
        }
        ProviderKind::CodexOauth => {
            // `base_url` is repurposed here as the app-server command path;
            // codex-oauth profiles have no HTTP endpoint of their own.
            let command = profile.base_url.clone().unwrap_or_else(|| "codex".to_string());
            Some(Arc::new(CodexOauthProvider::new(command, Vec::new())))
        }
    }
}

fn check_auth(state: &GatewayState, headers: &HeaderMap) -> Result<(), Response> {
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    state
        .auth
        .verify_token(provided)
        .map_err(|_| (StatusCode::UNAUTHORIZED, "unauthorized").into_response())
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let sessions = state.store.list().map(|s| s.len()).unwrap_or(0);
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

async fn create_session_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionRequest>,
) -> Response {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }
    let id = body.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    match state.store.ensure_session(&id, body.title, None) {
        Ok(meta) => Json(meta).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn list_sessions_handler(State(state): State<Arc<GatewayState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }
    match state.store.list() {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn reset_session_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> Response {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }
    match state.store.reset_transcript(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn delete_session_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> Response {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }
    if state.lock.is_locked(&id) {
        return error_response(&Error::SessionInUse(id));
    }
    state.approvals.cancel_session(&id).await;
    match state.store.delete_session(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct ApprovalDecisionRequest {
    decision: String,
}

async fn approval_decision_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<ApprovalDecisionRequest>,
) -> Response {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }
    let decision = match body.decision.as_str() {
        "approve" => ApprovalDecision::Approve,
        "deny" => ApprovalDecision::Deny,
        other => return error_response(&Error::invalid_request(format!("unknown decision: {other}"))),
    };
    match state.approvals.decide(&id, decision).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn chat_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> Response {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }
    if let Err(e) = state.orchestrator.validate(&body) {
        return error_response(&e);
    }

    let cancel = CancellationToken::new();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let orchestrator = state.orchestrator.clone();
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        orchestrator.handle_chat(body, task_cancel, tx).await;
    });

    let stream = UnboundedReceiverStream::new(rx).map(|event| {
        let tag = event_tag(&event);
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, std::convert::Infallible>(Event::default().event(tag).data(data))
    });
    let stream = CancelOnDisconnect { inner: stream, cancel };

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

/// Cancels the turn's [`CancellationToken`] when the SSE stream is dropped
/// before it finishes — axum drops the response stream as soon as the
/// client disconnects, which is the only disconnect signal available here
/// (spec §5: a dropped client connection cancels the upstream call, any
/// pending approval, and further writes).
struct CancelOnDisconnect<S> {
    inner: S,
    cancel: CancellationToken,
}

impl<S: Stream + Unpin> Stream for CancelOnDisconnect<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<S> Drop for CancelOnDisconnect<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn event_tag(event: &ChatEvent) -> &'static str {
    match event {
        ChatEvent::Meta { .. } => "meta",
        ChatEvent::AssistantStart => "assistant_start",
        ChatEvent::Delta { .. } => "delta",
        ChatEvent::AssistantEnd { .. } => "assistant_end",
        ChatEvent::ToolCall { .. } => "tool_call",
        ChatEvent::ToolResult { .. } => "tool_result",
        ChatEvent::Final { .. } => "final",
        ChatEvent::Error { .. } => "error",
        ChatEvent::Done { .. } => "done",
    }
}

#[derive(Deserialize)]
struct ArtifactQuery {
    path: String,
}

async fn artifacts_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<ArtifactQuery>,
) -> Response {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }
    serve_artifact(&state.workspace_root, &query.path)
}

fn error_response(e: &Error) -> Response {
    let status = match e.kind() {
        "invalid_request" | "bad_arguments_json" | "invalid_destination" => StatusCode::BAD_REQUEST,
        "session_not_found" | "file_not_found" | "unknown_tool" => StatusCode::NOT_FOUND,
        "session_in_use" => StatusCode::CONFLICT,
        "forbidden_artifact_ref" | "tool_disabled" | "adapter_disabled" => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({"error": {"kind": e.kind(), "message": e.to_string()}})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropping_sse_stream_cancels_token() {
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel::<ChatEvent>();
        let cancel = CancellationToken::new();
        let stream = CancelOnDisconnect {
            inner: UnboundedReceiverStream::new(rx),
            cancel: cancel.clone(),
        };
        assert!(!cancel.is_cancelled());
        drop(stream);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn error_response_maps_kind_to_status() {
        assert_eq!(
            error_response(&Error::invalid_request("bad")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_response(&Error::session_not_found("s1")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_response(&Error::Internal("boom".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn event_tag_covers_every_variant() {
        assert_eq!(event_tag(&ChatEvent::AssistantStart), "assistant_start");
        assert_eq!(
            event_tag(&ChatEvent::Delta { text: "x".into() }),
            "delta"
        );
        assert_eq!(
            event_tag(&ChatEvent::Done { reason: "complete".into() }),
            "done"
        );
    }

    #[test]
    fn build_provider_skips_anthropic_profile_missing_env_key() {
        std::env::remove_var("ECLIA_TEST_MISSING_KEY");
        let profile = ProviderProfile {
            provider: ProviderKind::Anthropic,
            base_url: None,
            default_model: Some("claude-sonnet-4-20250514".into()),
            api_key_env: Some("ECLIA_TEST_MISSING_KEY".into()),
        };
        assert!(build_provider(&profile).is_none());
    }

    #[test]
    fn build_provider_builds_openai_compat_without_api_key() {
        let profile = ProviderProfile {
            provider: ProviderKind::OpenaiCompat,
            base_url: Some("http://localhost:11434/v1".into()),
            default_model: Some("llama3".into()),
            api_key_env: None,
        };
        assert!(build_provider(&profile).is_some());
    }

    #[test]
    fn build_provider_requires_base_url_for_openai_compat() {
        let profile = ProviderProfile {
            provider: ProviderKind::OpenaiCompat,
            base_url: None,
            default_model: None,
            api_key_env: None,
        };
        assert!(build_provider(&profile).is_none());
    }
}
