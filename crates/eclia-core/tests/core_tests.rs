//! Comprehensive tests for eclia-core: types, config, errors.

use eclia_core::config::{AllowlistRule, AuthMode, BindMode, EcliaConfig};
use eclia_core::*;

// ===========================================================================
// SessionKey
// ===========================================================================

#[test]
fn session_key_new_and_display() {
    let key = SessionKey::new("abc-123");
    assert_eq!(key.as_str(), "abc-123");
    assert_eq!(format!("{}", key), "abc-123");
}

#[test]
fn session_key_clone_is_cheap() {
    let key = SessionKey::new("test");
    let cloned = key.clone();
    assert_eq!(key, cloned);
    assert_eq!(key.as_str(), cloned.as_str());
}

#[test]
fn session_key_equality_and_hash() {
    use std::collections::HashSet;
    let a = SessionKey::new("same");
    let b = SessionKey::new("same");
    let c = SessionKey::new("different");
    assert_eq!(a, b);
    assert_ne!(a, c);
    let mut set = HashSet::new();
    set.insert(a.clone());
    assert!(set.contains(&b));
    assert!(!set.contains(&c));
}

// ===========================================================================
// Role / TranscriptRecord
// ===========================================================================

#[test]
fn role_serde_roundtrip() {
    let roles = vec![Role::System, Role::User, Role::Assistant, Role::Tool];
    for role in roles {
        let json = serde_json::to_string(&role).unwrap();
        let back: Role = serde_json::from_str(&json).unwrap();
        assert_eq!(role, back);
    }
}

#[test]
fn role_serializes_lowercase() {
    assert_eq!(serde_json::to_string(&Role::System).unwrap(), r#""system""#);
    assert_eq!(serde_json::to_string(&Role::Tool).unwrap(), r#""tool""#);
}

#[test]
fn transcript_message_record_roundtrip() {
    let now = chrono::Utc::now();
    let rec = TranscriptRecord::message(Role::User, "hello", now);
    let json = serde_json::to_string(&rec).unwrap();
    assert!(json.contains(r#""kind":"message""#));
    let back: TranscriptRecord = serde_json::from_str(&json).unwrap();
    match back {
        TranscriptRecord::Message { role, content, .. } => {
            assert_eq!(role, Role::User);
            assert_eq!(content, "hello");
        }
        _ => panic!("expected Message"),
    }
}

#[test]
fn transcript_turn_record_roundtrip() {
    let now = chrono::Utc::now();
    let rec = TranscriptRecord::Turn {
        turn_id: "t1".into(),
        upstream_model: "anthropic:default".into(),
        token_budget: 2048,
        used_tokens: 512,
        git_commit: None,
        runtime_overrides: serde_json::json!({}),
        timestamp: now,
    };
    let json = serde_json::to_string(&rec).unwrap();
    assert!(json.contains(r#""kind":"turn""#));
}

#[test]
fn tool_call_with_index() {
    let tc = ToolCall {
        call_id: "c1".into(),
        name: "exec".into(),
        args_raw: r#"{"cmd":"ls"}"#.into(),
        index: Some(0),
    };
    let json = serde_json::to_string(&tc).unwrap();
    let back: ToolCall = serde_json::from_str(&json).unwrap();
    assert_eq!(back.call_id, "c1");
    assert_eq!(back.index, Some(0));
}

// ===========================================================================
// Session id validation
// ===========================================================================

#[test]
fn session_id_validation() {
    assert!(is_valid_session_id("s1"));
    assert!(!is_valid_session_id(""));
    assert!(!is_valid_session_id("has space"));
}

// ===========================================================================
// RouteKey
// ===========================================================================

#[test]
fn route_key_parse_and_display_is_identity() {
    for s in ["anthropic:default", "openai-compat:fast", "codex-oauth:main"] {
        let k = RouteKey::parse(s, ProviderKind::Anthropic).unwrap();
        assert_eq!(k.to_string(), s);
    }
}

#[test]
fn route_key_unknown_scheme_rejected() {
    assert!(RouteKey::parse("bogus:default", ProviderKind::Anthropic).is_none());
}

// ===========================================================================
// Origin
// ===========================================================================

#[test]
fn origin_tagged_serde() {
    let o = Origin::Discord {
        guild: Some("g1".into()),
        channel: Some("c1".into()),
        thread: None,
    };
    let json = serde_json::to_string(&o).unwrap();
    assert!(json.contains(r#""kind":"discord""#));
    let back: Origin = serde_json::from_str(&json).unwrap();
    assert_eq!(o, back);
}

// ===========================================================================
// EcliaConfig
// ===========================================================================

#[test]
fn eclia_config_defaults() {
    let config = EcliaConfig::default();
    assert_eq!(config.port, 18789);
    assert!(matches!(config.bind, BindMode::Loopback));
    assert!(matches!(config.auth.mode, AuthMode::Token));
}

#[test]
fn eclia_config_serde_roundtrip() {
    let config = EcliaConfig::default();
    let json = serde_json::to_string(&config).unwrap();
    let back: EcliaConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back.port, 18789);
}

#[test]
fn bind_mode_to_addr() {
    assert_eq!(BindMode::Loopback.to_addr(), "127.0.0.1");
    assert_eq!(BindMode::Lan.to_addr(), "0.0.0.0");
}

#[test]
fn allowlist_exact_match() {
    let rule = AllowlistRule::Exact {
        match_exact: "git".into(),
        args: None,
    };
    assert!(rule.matches("git", &["status".to_string()]));
    assert!(!rule.matches("rm", &["-rf".to_string()]));
}

// ===========================================================================
// Error
// ===========================================================================

#[test]
fn error_kind_taxonomy() {
    assert_eq!(Error::invalid_request("x").kind(), "invalid_request");
    assert_eq!(Error::session_not_found("s1").kind(), "session_not_found");
    assert_eq!(Error::ApprovalDenied.kind(), "approval_denied");
}

#[test]
fn error_upstream_http_display() {
    let e = Error::upstream_http(502, "bad gateway");
    assert!(e.to_string().contains("502"));
}

#[test]
fn error_from_io() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let e: Error = io_err.into();
    assert_eq!(e.kind(), "internal");
}
