//! Data model shared across the gateway (spec §3).

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Session identifier — cheaply cloneable, validated against the session id
/// charset rule (`[A-Za-z0-9_-]{1,120}`) at construction sites, not here.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(Arc<str>);

impl SessionKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SessionKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Enforces the session id charset rule from spec §3.
pub fn is_valid_session_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 120
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Message role.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Tagged origin descriptor for where a chat request came from.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Origin {
    Web,
    Discord {
        guild: Option<String>,
        channel: Option<String>,
        thread: Option<String>,
    },
    Telegram {
        chat_id: Option<String>,
        thread_id: Option<String>,
    },
}

impl Origin {
    /// Same `kind` discriminator, used to decide whether an origin patch is
    /// compatible with the stored one (spec §4.7 step 1).
    pub fn same_kind(&self, other: &Origin) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// A tool call emitted by the assistant. `index` preserves model-supplied
/// ordering when the upstream provider exposes one (e.g. OpenAI-compatible's
/// `tool_calls[i]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub args_raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

/// Session-level metadata, persisted as `meta.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionMeta {
    #[serde(default = "default_version")]
    pub version: u32,
    pub id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub origin: Option<Origin>,
    #[serde(default)]
    pub last_route_key: Option<String>,
}

fn default_version() -> u32 {
    1
}

impl SessionMeta {
    pub fn new(id: impl Into<String>, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            version: default_version(),
            id: id.into(),
            created_at: now,
            updated_at: now,
            title: None,
            origin: None,
            last_route_key: None,
        }
    }
}

/// One transcript record. Serialized one-per-line as ND-JSON.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TranscriptRecord {
    Message {
        role: Role,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCall>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        /// Set only on `role: tool` records: whether the tool call failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_is_error: Option<bool>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    Turn {
        turn_id: String,
        upstream_model: String,
        token_budget: usize,
        used_tokens: usize,
        #[serde(default)]
        git_commit: Option<String>,
        #[serde(default)]
        runtime_overrides: serde_json::Value,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl TranscriptRecord {
    pub fn message(
        role: Role,
        content: impl Into<String>,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self::Message {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            tool_is_error: None,
            timestamp,
        }
    }

    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCall>,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self::Message {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_call_id: None,
            tool_is_error: None,
            timestamp,
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self::Message {
            role: Role::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            tool_is_error: Some(is_error),
            timestamp,
        }
    }

    pub fn timestamp(&self) -> chrono::DateTime<chrono::Utc> {
        match self {
            Self::Message { timestamp, .. } => *timestamp,
            Self::Turn { timestamp, .. } => *timestamp,
        }
    }
}

/// Terminal decision on an approval ticket.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Deny,
    Timeout,
    Cancelled,
}

/// A pending authorization request for a side-effecting tool call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalTicket {
    pub approval_id: String,
    pub session_id: String,
    pub reason: String,
    pub tool: String,
    pub args: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Artifact kind, inferred from MIME class on read.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Image,
    Json,
    Text,
    File,
}

/// Metadata computed for an artifact on read (spec §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub kind: ArtifactKind,
    /// Repo-relative path, e.g. `.eclia/artifacts/s1/c1/out.png`.
    pub path: String,
    /// `eclia://artifact/<path>`.
    pub uri: String,
    /// Angle-bracket form accepted in text contexts: `<eclia://artifact/...>`.
    #[serde(rename = "ref")]
    pub ref_: String,
    pub bytes: u64,
    pub mime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Destination tagged variant for the `send` tool.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Destination {
    Origin,
    Web,
    Discord { channel: String },
    Telegram { chat_id: String },
}

/// Per-request approval policy (spec §4.6, §6 `toolAccessMode`).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolAccessMode {
    Full,
    #[default]
    Safe,
}

/// Which SSE events a `/api/chat` request receives (spec §4.7).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    #[default]
    Full,
    Final,
}

/// Provider scheme recognized in a route key.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    OpenaiCompat,
    Anthropic,
    CodexOauth,
}

impl ProviderKind {
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::OpenaiCompat => "openai-compat",
            Self::Anthropic => "anthropic",
            Self::CodexOauth => "codex-oauth",
        }
    }

    pub fn from_scheme(s: &str) -> Option<Self> {
        match s {
            "openai-compat" => Some(Self::OpenaiCompat),
            "anthropic" => Some(Self::Anthropic),
            "codex-oauth" => Some(Self::CodexOauth),
            _ => None,
        }
    }
}

/// A parsed `<scheme>:<profileId>` route key (spec §3, §6).
#[derive(Clone, Debug, PartialEq)]
pub struct RouteKey {
    pub provider: ProviderKind,
    pub profile_id: String,
}

impl RouteKey {
    /// Parse a route key, canonicalizing a missing scheme prefix to
    /// `default_provider`.
    pub fn parse(s: &str, default_provider: ProviderKind) -> Option<Self> {
        match s.split_once(':') {
            Some((scheme, profile)) => {
                let provider = ProviderKind::from_scheme(scheme)?;
                Some(Self {
                    provider,
                    profile_id: profile.to_string(),
                })
            }
            None => Some(Self {
                provider: default_provider,
                profile_id: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider.scheme(), self.profile_id)
    }
}
