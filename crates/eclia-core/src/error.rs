//! Error taxonomy for the gateway core (spec §7).
//!
//! Every variant here is either surfaced as an HTTP status before any SSE
//! begins (`invalid_request`, `session_not_found`), or folded into a
//! `tool_result{ok:false}` / SSE `error` event without aborting the session.
//! `ErrorKind` is the stable wire discriminator used in error payloads.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session in use: {0}")]
    SessionInUse(String),

    #[error("upstream http error: status={status} body={body_snippet:?}")]
    UpstreamHttp { status: u16, body_snippet: String },

    #[error("upstream network error: {0}")]
    UpstreamNetwork(String),

    #[error("tool host error: {0}")]
    ToolhostError(String),

    #[error("tool host timed out after {timeout_ms}ms")]
    ToolhostTimeout { timeout_ms: u64 },

    #[error("tool host returned a malformed result: {0}")]
    ToolhostBadResult(String),

    #[error("bad arguments json: {0}")]
    BadArgumentsJson(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool disabled: {0}")]
    ToolDisabled(String),

    #[error("approval denied")]
    ApprovalDenied,

    #[error("approval timed out")]
    ApprovalTimeout,

    #[error("approval cancelled")]
    ApprovalCancelled,

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("adapter disabled: {0}")]
    AdapterDisabled(String),

    #[error("bad artifact ref: {0}")]
    BadArtifactRef(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("forbidden artifact ref: {0}")]
    ForbiddenArtifactRef(String),

    #[error("config write failed: {0}")]
    ConfigWriteFailed(String),

    #[error("codex login failed: {0}")]
    CodexLoginFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable wire discriminator for this error, matching spec §7's taxonomy
    /// names exactly so adapters/tests can match on `kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionInUse(_) => "session_in_use",
            Self::UpstreamHttp { .. } => "upstream_http",
            Self::UpstreamNetwork(_) => "upstream_network",
            Self::ToolhostError(_) => "toolhost_error",
            Self::ToolhostTimeout { .. } => "toolhost_timeout",
            Self::ToolhostBadResult(_) => "toolhost_bad_result",
            Self::BadArgumentsJson(_) => "bad_arguments_json",
            Self::UnknownTool(_) => "unknown_tool",
            Self::ToolDisabled(_) => "tool_disabled",
            Self::ApprovalDenied => "approval_denied",
            Self::ApprovalTimeout => "approval_timeout",
            Self::ApprovalCancelled => "approval_cancelled",
            Self::InvalidDestination(_) => "invalid_destination",
            Self::AdapterDisabled(_) => "adapter_disabled",
            Self::BadArtifactRef(_) => "bad_artifact_ref",
            Self::FileNotFound(_) => "file_not_found",
            Self::ForbiddenArtifactRef(_) => "forbidden_artifact_ref",
            Self::ConfigWriteFailed(_) => "config_write_failed",
            Self::CodexLoginFailed(_) => "codex_login_failed",
            Self::Io(_) | Self::Json(_) | Self::Internal(_) => "internal",
        }
    }

    /// Truncate an upstream response body to the 240-byte snippet spec §4.5
    /// mandates for `UpstreamHttp`.
    pub fn upstream_http(status: u16, body: &str) -> Self {
        let snippet: String = body.chars().take(240).collect();
        Self::UpstreamHttp {
            status,
            body_snippet: snippet,
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::SessionNotFound(id.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_taxonomy_names() {
        assert_eq!(Error::invalid_request("x").kind(), "invalid_request");
        assert_eq!(Error::ApprovalDenied.kind(), "approval_denied");
        assert_eq!(Error::ApprovalTimeout.kind(), "approval_timeout");
        assert_eq!(Error::ApprovalCancelled.kind(), "approval_cancelled");
    }

    #[test]
    fn upstream_http_snippet_is_clamped() {
        let body = "x".repeat(500);
        let err = Error::upstream_http(502, &body);
        match err {
            Error::UpstreamHttp { status, body_snippet } => {
                assert_eq!(status, 502);
                assert_eq!(body_snippet.chars().count(), 240);
            }
            _ => panic!("expected UpstreamHttp"),
        }
    }
}
