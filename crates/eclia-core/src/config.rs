//! Process-level gateway config: port, bind mode, auth, provider profiles,
//! and the exec allowlist. Loading/writing this file for the REST config
//! editing surface is out of scope; this module only owns the struct and its
//! defaulted, graceful-fallback load.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::types::ProviderKind;

fn default_port() -> u16 {
    18789
}

/// Bind mode for the HTTP listener.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    #[default]
    Loopback,
    Lan,
}

impl BindMode {
    pub fn to_addr(&self) -> &'static str {
        match self {
            BindMode::Loopback => "127.0.0.1",
            BindMode::Lan => "0.0.0.0",
        }
    }
}

/// Authentication mode for the gateway's bearer token.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Token,
    None,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    #[serde(default)]
    pub token: Option<String>,
}

/// A named set of provider credentials and default upstream model id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub provider: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    /// Env var name to read the API key / bearer token from at start_gateway
    /// time, matching the teacher's `ANTHROPIC_API_KEY`-style env lookup.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

/// One exec allowlist rule — a command is pre-approved in safe mode if it
/// matches any configured rule (spec §4.6).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "lowercase")]
pub enum AllowlistRule {
    Prefix {
        match_prefix: String,
        #[serde(default)]
        args: Option<Vec<String>>,
    },
    Exact {
        match_exact: String,
        #[serde(default)]
        args: Option<Vec<String>>,
    },
}

impl AllowlistRule {
    /// Does this rule cover `cmd` invoked with `call_args`? When a rule
    /// carries `args`, the call's argument list must match it exactly —
    /// otherwise the rule allowlists the bare command regardless of
    /// arguments (spec.md:116 `{matchPrefix|matchExact, args?}`).
    pub fn matches(&self, cmd: &str, call_args: &[String]) -> bool {
        match self {
            AllowlistRule::Prefix { match_prefix, args } => {
                cmd.starts_with(match_prefix.as_str()) && args_match(args, call_args)
            }
            AllowlistRule::Exact { match_exact, args } => cmd == match_exact && args_match(args, call_args),
        }
    }
}

fn args_match(rule_args: &Option<Vec<String>>, call_args: &[String]) -> bool {
    match rule_args {
        None => true,
        Some(expected) => expected.as_slice() == call_args,
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecToolConfig {
    #[serde(default)]
    pub allowlist: Vec<AllowlistRule>,
    /// Per-call timeout default in ms; exec clamps to <= 1h (spec §5).
    #[serde(default = "default_exec_timeout_ms")]
    pub default_timeout_ms: u64,
}

fn default_exec_timeout_ms() -> u64 {
    60_000
}

/// Loopback endpoint the `send` tool POSTs to for a chat-adapter
/// destination (spec §6 "Adapter outbound protocol").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub port: u16,
    pub key: String,
}

/// Configured backend the `web` tool proxies search/extract calls to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebSearchConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EcliaConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub bind: BindMode,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderProfile>,
    #[serde(default)]
    pub exec: ExecToolConfig,
    /// Keyed by destination kind (`discord`, `telegram`).
    #[serde(default)]
    pub adapters: HashMap<String, AdapterConfig>,
    #[serde(default)]
    pub web_search: Option<WebSearchConfig>,
    /// Root directory under which `.eclia/` is created. Defaults to cwd.
    #[serde(default)]
    pub workspace_root: Option<String>,
}

impl Default for EcliaConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: BindMode::default(),
            auth: AuthConfig::default(),
            default_provider: None,
            providers: HashMap::new(),
            exec: ExecToolConfig::default(),
            adapters: HashMap::new(),
            web_search: None,
            workspace_root: None,
        }
    }
}

impl EcliaConfig {
    /// Load from a JSON file, falling back to defaults if absent — mirrors
    /// the teacher's `OpenclawConfig::load` graceful-fallback behavior.
    pub fn load(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn default_provider_kind(&self) -> ProviderKind {
        self.default_provider
            .as_deref()
            .and_then(ProviderKind::from_scheme)
            .unwrap_or(ProviderKind::Anthropic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_file() {
        let cfg = EcliaConfig::load(Path::new("/nonexistent/eclia.json")).unwrap();
        assert_eq!(cfg.port, 18789);
        assert_eq!(cfg.bind, BindMode::Loopback);
    }

    #[test]
    fn allowlist_prefix_match_ignores_args_when_rule_has_none() {
        let rule = AllowlistRule::Prefix {
            match_prefix: "git".to_string(),
            args: None,
        };
        assert!(rule.matches("git", &["status".to_string()]));
        assert!(rule.matches("git", &["push".to_string(), "--force".to_string()]));
        assert!(!rule.matches("rm", &["-rf".to_string(), "/".to_string()]));
    }

    #[test]
    fn allowlist_rule_with_args_requires_exact_arg_match() {
        let rule = AllowlistRule::Exact {
            match_exact: "git".to_string(),
            args: Some(vec!["status".to_string()]),
        };
        assert!(rule.matches("git", &["status".to_string()]));
        assert!(!rule.matches("git", &["push".to_string()]));
        assert!(!rule.matches("git", &[]));
    }
}
