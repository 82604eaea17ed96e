//! Route resolution (spec §3, §4.7 step 3): parsing a `<scheme>:<profileId>`
//! route key into an `UpstreamSelection`. Grounded on `eclia_core::RouteKey`
//! for the grammar and the teacher's single-provider `AgentRuntime::new`
//! wiring, generalized to a table of named profiles since spec.md's route
//! key carries a profile id the teacher never had.

use std::collections::HashMap;
use std::sync::Arc;

use eclia_core::{ProviderKind, RouteKey};
use eclia_llm::{LlmError, LlmResult, UpstreamProvider};

/// Resolved upstream target for one chat turn.
#[derive(Clone)]
pub struct UpstreamSelection {
    pub provider: Arc<dyn UpstreamProvider>,
    pub upstream_model_id: String,
    pub route_key: String,
}

struct RegisteredProvider {
    provider: Arc<dyn UpstreamProvider>,
    default_model: String,
}

/// Static table of configured provider profiles, built once at startup from
/// `EcliaConfig.providers` and injected into the orchestrator.
#[derive(Default)]
pub struct RouteResolver {
    profiles: HashMap<String, RegisteredProvider>,
    default_provider: Option<ProviderKind>,
}

impl RouteResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_provider(mut self, kind: ProviderKind) -> Self {
        self.default_provider = Some(kind);
        self
    }

    /// Registers a profile under its full route key, e.g. `anthropic:default`.
    pub fn register(
        &mut self,
        route_key: impl Into<String>,
        provider: Arc<dyn UpstreamProvider>,
        default_model: impl Into<String>,
    ) {
        self.profiles.insert(
            route_key.into(),
            RegisteredProvider {
                provider,
                default_model: default_model.into(),
            },
        );
    }

    /// Resolves `model_field` (the request's `model`, which is a route key,
    /// not an upstream model id) to a concrete upstream selection.
    pub fn resolve(&self, model_field: &str) -> LlmResult<UpstreamSelection> {
        let default_provider = self.default_provider.unwrap_or(ProviderKind::Anthropic);
        let key = RouteKey::parse(model_field, default_provider)
            .ok_or_else(|| LlmError::RequestFailed(format!("unparseable route key: {model_field}")))?;
        let canonical = key.to_string();
        let entry = self.profiles.get(&canonical).ok_or_else(|| {
            LlmError::RequestFailed(format!("no provider profile registered for {canonical}"))
        })?;
        if !entry.provider.supports_model(&entry.default_model) {
            return Err(LlmError::RequestFailed(format!(
                "profile {canonical} default model {} is not supported by its provider",
                entry.default_model
            )));
        }
        Ok(UpstreamSelection {
            provider: entry.provider.clone(),
            upstream_model_id: entry.default_model.clone(),
            route_key: canonical,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eclia_llm::AnthropicProvider;

    #[test]
    fn resolves_registered_profile() {
        let mut resolver = RouteResolver::new().with_default_provider(ProviderKind::Anthropic);
        let provider: Arc<dyn UpstreamProvider> = Arc::new(AnthropicProvider::new("test-key"));
        resolver.register("anthropic:default", provider, "claude-sonnet-4-20250514");

        let selection = resolver.resolve("anthropic:default").unwrap();
        assert_eq!(selection.route_key, "anthropic:default");
        assert_eq!(selection.upstream_model_id, "claude-sonnet-4-20250514");
    }

    #[test]
    fn missing_scheme_uses_default_provider() {
        let mut resolver = RouteResolver::new().with_default_provider(ProviderKind::Anthropic);
        let provider: Arc<dyn UpstreamProvider> = Arc::new(AnthropicProvider::new("test-key"));
        resolver.register("anthropic:default", provider, "claude-sonnet-4-20250514");

        let selection = resolver.resolve("default").unwrap();
        assert_eq!(selection.route_key, "anthropic:default");
    }

    #[test]
    fn unregistered_profile_is_an_error() {
        let resolver = RouteResolver::new().with_default_provider(ProviderKind::Anthropic);
        assert!(resolver.resolve("anthropic:default").is_err());
    }
}
