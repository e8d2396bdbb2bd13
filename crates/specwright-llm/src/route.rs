//! Route resolution
//!
//! Pure mapping from {role, reason, model override} and configuration to a
//! primary route, an optional distinct fallback route and the output-token
//! ceiling each may use. Identical inputs always resolve identically.

use crate::config::{
    LlmConfig, ReasonGroup, Role, COMPAT_OUTPUT_TOKENS, DEFAULT_OUTPUT_TOKENS,
};
use crate::error::{Error, Result};
use specwright_core::mask_api_key;
use std::fmt;
use tracing::debug;

/// Resolved (provider, model, base_url, api_key) tuple for one role
#[derive(Clone, PartialEq, Eq)]
pub struct Route {
    /// Role the route was resolved for
    pub role: Role,
    /// Provider identity
    pub provider: String,
    /// Model name
    pub model: String,
    /// Chat-completions base URL
    pub base_url: String,
    /// Bearer API key (may be empty when nothing is configured)
    pub api_key: String,
}

impl Route {
    /// Identity used to deduplicate primary and fallback routes
    #[must_use]
    pub fn fingerprint(&self) -> String {
        format!("{}|{}|{}", self.provider, self.base_url, self.model)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("role", &self.role)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &mask_api_key(&self.api_key))
            .finish()
    }
}

/// A resolved primary route, optional fallback and their token ceilings
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    /// Primary route
    pub primary: Route,
    /// Output-token ceiling for the primary route
    pub max_output_tokens: u32,
    /// Fallback route, absent when it would duplicate the primary
    pub fallback: Option<Route>,
    /// Output-token ceiling for the fallback route
    pub fallback_max_output_tokens: Option<u32>,
}

// ============================================================================
// Provider inference
// ============================================================================

fn is_gemini(model: &str) -> bool {
    model.starts_with("gemini")
}

fn is_openai(model: &str) -> bool {
    model.starts_with("gpt-") || model.starts_with("o1") || model.starts_with("o3")
}

fn is_anthropic(model: &str) -> bool {
    model.starts_with("claude")
}

fn is_deepseek(model: &str) -> bool {
    model.starts_with("deepseek")
}

fn is_groq(model: &str) -> bool {
    model.starts_with("llama") || model.starts_with("mixtral")
}

/// Prioritized (predicate, provider) matchers. New providers are added by
/// appending an entry; resolution itself never changes.
pub const PROVIDER_MATCHERS: &[(fn(&str) -> bool, &str)] = &[
    (is_gemini, "gemini"),
    (is_openai, "openai"),
    (is_anthropic, "anthropic"),
    (is_deepseek, "deepseek"),
    (is_groq, "groq"),
];

/// Infer the provider a model name belongs to, if any matcher claims it
#[must_use]
pub fn infer_provider(model: &str) -> Option<&'static str> {
    PROVIDER_MATCHERS
        .iter()
        .find(|(matches, _)| matches(model))
        .map(|(_, provider)| *provider)
}

/// Built-in chat-completions base URL per provider
#[must_use]
pub fn default_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("https://api.openai.com/v1"),
        "gemini" => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
        "anthropic" => Some("https://api.anthropic.com/v1"),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        "groq" => Some("https://api.groq.com/openai/v1"),
        _ => None,
    }
}

/// Providers that do not honor arbitrary output-token limits
#[must_use]
pub fn needs_compat_ceiling(provider: &str) -> bool {
    matches!(provider, "gemini" | "anthropic")
}

// ============================================================================
// Resolution
// ============================================================================

/// Iterate roles in a fixed order so default assembly is deterministic
const ROLE_ORDER: &[Role] = &[Role::Plan, Role::Extract, Role::Validate, Role::Write];

/// Provider settings assembled from every role's matching-provider config,
/// then environment fallbacks, then built-in defaults.
fn provider_defaults(config: &LlmConfig, provider: &str) -> (Option<String>, Option<String>) {
    let mut base_url = None;
    let mut api_key = None;

    for role in ROLE_ORDER {
        let Some(role_cfg) = config.roles.get(role) else {
            continue;
        };
        if role_cfg.provider == provider {
            base_url = base_url.or_else(|| role_cfg.base_url.clone());
            api_key = api_key.or_else(|| role_cfg.api_key.clone());
        }
        if let Some(fb) = &role_cfg.fallback {
            if fb.provider.as_deref() == Some(provider) {
                base_url = base_url.or_else(|| fb.base_url.clone());
                api_key = api_key.or_else(|| fb.api_key.clone());
            }
        }
    }

    let env_prefix = provider.to_uppercase();
    base_url = base_url.or_else(|| std::env::var(format!("{env_prefix}_BASE_URL")).ok());
    api_key = api_key.or_else(|| std::env::var(format!("{env_prefix}_API_KEY")).ok());
    base_url = base_url.or_else(|| default_base_url(provider).map(String::from));

    (base_url, api_key)
}

fn build_route(
    config: &LlmConfig,
    role: Role,
    configured_provider: &str,
    model: &str,
    configured_base_url: Option<&str>,
    configured_api_key: Option<&str>,
) -> Route {
    let mut provider = configured_provider.to_string();
    let mut base_url = configured_base_url.map(String::from);
    let mut api_key = configured_api_key.map(String::from);

    // The model's inferred provider wins over the configured one; credentials
    // are then re-sourced from that provider's defaults, never mixed across
    // providers.
    if let Some(inferred) = infer_provider(model) {
        if inferred != provider {
            debug!(
                role = role.as_str(),
                configured = %provider,
                inferred,
                model,
                "model overrides configured provider"
            );
            let (default_url, default_key) = provider_defaults(config, inferred);
            provider = inferred.to_string();
            base_url = default_url;
            api_key = default_key;
        }
    }

    if base_url.is_none() || api_key.is_none() {
        let (default_url, default_key) = provider_defaults(config, &provider);
        base_url = base_url.or(default_url);
        api_key = api_key.or(default_key);
    }

    Route {
        role,
        provider,
        model: model.to_string(),
        base_url: base_url.unwrap_or_default(),
        api_key: api_key.unwrap_or_default(),
    }
}

/// Output-token ceiling for a route: the minimum of the model profile's
/// maximum, the role-and-reason-group cap, and the compatibility ceiling
/// when the provider does not honor arbitrary limits.
#[must_use]
pub fn output_ceiling(config: &LlmConfig, route: &Route, reason: &str) -> u32 {
    let profile_max = config
        .model_profiles
        .get(&route.model)
        .map_or(DEFAULT_OUTPUT_TOKENS.max(COMPAT_OUTPUT_TOKENS), |p| {
            p.max_output_tokens
        });
    let role_cap = config
        .token_caps
        .cap(route.role, ReasonGroup::from_reason(reason));

    let mut ceiling = profile_max.min(role_cap);
    if needs_compat_ceiling(&route.provider) {
        ceiling = ceiling.min(COMPAT_OUTPUT_TOKENS);
    }
    ceiling
}

/// Honor a requested token count at or below the ceiling; clamp above it
#[must_use]
pub fn clamp_max_tokens(requested: Option<u32>, ceiling: u32) -> u32 {
    match requested {
        Some(requested) => requested.min(ceiling),
        None => ceiling,
    }
}

/// Resolve the primary route, optional fallback route and token ceilings
/// for a call.
///
/// # Errors
/// Returns `Error::NotConfigured` when the role has no route settings.
pub fn resolve_route(
    config: &LlmConfig,
    role: Option<Role>,
    reason: &str,
    model_override: Option<&str>,
) -> Result<ResolvedRoute> {
    let role = role.unwrap_or_else(|| Role::from_reason(reason));
    let role_cfg = config
        .roles
        .get(&role)
        .ok_or_else(|| Error::NotConfigured(format!("no route for role {}", role.as_str())))?;

    let model = model_override.unwrap_or(&role_cfg.model);
    let primary = build_route(
        config,
        role,
        &role_cfg.provider,
        model,
        role_cfg.base_url.as_deref(),
        role_cfg.api_key.as_deref(),
    );
    let max_output_tokens = output_ceiling(config, &primary, reason);

    let fallback = role_cfg.fallback.as_ref().map(|fb| {
        let provider = fb
            .provider
            .clone()
            .or_else(|| infer_provider(&fb.model).map(String::from))
            .unwrap_or_else(|| role_cfg.provider.clone());
        build_route(
            config,
            role,
            &provider,
            &fb.model,
            fb.base_url.as_deref(),
            fb.api_key.as_deref(),
        )
    });

    // A fallback identical to the primary buys nothing
    let fallback = fallback.filter(|fb| fb.fingerprint() != primary.fingerprint());
    let fallback_max_output_tokens = fallback
        .as_ref()
        .map(|fb| output_ceiling(config, fb, reason));

    Ok(ResolvedRoute {
        primary,
        max_output_tokens,
        fallback,
        fallback_max_output_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FallbackConfig, ModelProfile, RoleCaps, RouteConfig};
    use std::collections::HashMap;

    fn test_config() -> LlmConfig {
        let mut roles = HashMap::new();
        roles.insert(
            Role::Extract,
            RouteConfig {
                provider: "openai".into(),
                model: "gpt-4o-mini".into(),
                base_url: Some("https://api.openai.com/v1".into()),
                api_key: Some("sk-extract-key-123".into()),
                fallback: Some(FallbackConfig {
                    provider: Some("deepseek".into()),
                    model: "deepseek-chat".into(),
                    base_url: Some("https://api.deepseek.com/v1".into()),
                    api_key: Some("ds-fallback-key-456".into()),
                }),
            },
        );
        roles.insert(
            Role::Plan,
            RouteConfig {
                provider: "gemini".into(),
                model: "gemini-1.5-flash".into(),
                base_url: Some("https://gemini.example/v1".into()),
                api_key: Some("gm-plan-key-789".into()),
                fallback: None,
            },
        );
        LlmConfig::new(roles)
    }

    #[test]
    fn test_provider_inference() {
        assert_eq!(infer_provider("gemini-1.5-pro"), Some("gemini"));
        assert_eq!(infer_provider("gpt-4o-mini"), Some("openai"));
        assert_eq!(infer_provider("o3-mini"), Some("openai"));
        assert_eq!(infer_provider("claude-3-5-haiku"), Some("anthropic"));
        assert_eq!(infer_provider("deepseek-chat"), Some("deepseek"));
        assert_eq!(infer_provider("llama-3.3-70b"), Some("groq"));
        assert_eq!(infer_provider("custom-model"), None);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let config = test_config();
        let first = resolve_route(&config, Some(Role::Extract), "spec_extract", None).unwrap();
        let second = resolve_route(&config, Some(Role::Extract), "spec_extract", None).unwrap();
        assert_eq!(first.primary, second.primary);
        assert_eq!(first.fallback, second.fallback);
        assert_eq!(first.max_output_tokens, second.max_output_tokens);
    }

    #[test]
    fn test_role_inferred_from_reason() {
        let config = test_config();
        let resolved = resolve_route(&config, None, "discovery_planner_round2", None).unwrap();
        assert_eq!(resolved.primary.role, Role::Plan);
        assert_eq!(resolved.primary.provider, "gemini");
    }

    #[test]
    fn test_override_forces_inferred_provider_with_its_defaults() {
        // Extract role defaults to openai; a gemini override must pull gemini
        // credentials from the plan role's gemini settings, not the extract
        // role's own.
        let config = test_config();
        let resolved = resolve_route(
            &config,
            Some(Role::Extract),
            "spec_extract",
            Some("gemini-1.5-pro"),
        )
        .unwrap();

        assert_eq!(resolved.primary.provider, "gemini");
        assert_eq!(resolved.primary.model, "gemini-1.5-pro");
        assert_eq!(resolved.primary.base_url, "https://gemini.example/v1");
        assert_eq!(resolved.primary.api_key, "gm-plan-key-789");
    }

    #[test]
    fn test_fallback_resolved_with_own_settings() {
        let config = test_config();
        let resolved = resolve_route(&config, Some(Role::Extract), "spec_extract", None).unwrap();
        let fallback = resolved.fallback.expect("fallback expected");

        assert_eq!(fallback.provider, "deepseek");
        assert_eq!(fallback.model, "deepseek-chat");
        assert_eq!(fallback.api_key, "ds-fallback-key-456");
        assert!(resolved.fallback_max_output_tokens.is_some());
    }

    #[test]
    fn test_fallback_suppressed_when_fingerprints_match() {
        let mut config = test_config();
        let extract = config.roles.get_mut(&Role::Extract).unwrap();
        extract.fallback = Some(FallbackConfig {
            provider: Some("openai".into()),
            model: "gpt-4o-mini".into(),
            base_url: Some("https://api.openai.com/v1".into()),
            api_key: Some("sk-extract-key-123".into()),
        });

        let resolved = resolve_route(&config, Some(Role::Extract), "spec_extract", None).unwrap();
        assert!(resolved.fallback.is_none());
        assert!(resolved.fallback_max_output_tokens.is_none());
    }

    #[test]
    fn test_fallback_provider_inferred_from_model() {
        let mut config = test_config();
        let extract = config.roles.get_mut(&Role::Extract).unwrap();
        extract.fallback = Some(FallbackConfig {
            provider: None,
            model: "deepseek-chat".into(),
            base_url: None,
            api_key: Some("ds-key-for-fallback".into()),
        });

        let resolved = resolve_route(&config, Some(Role::Extract), "spec_extract", None).unwrap();
        let fallback = resolved.fallback.expect("fallback expected");
        assert_eq!(fallback.provider, "deepseek");
        assert_eq!(fallback.base_url, "https://api.deepseek.com/v1");
    }

    #[test]
    fn test_missing_role_is_not_configured() {
        let config = test_config();
        let err = resolve_route(&config, Some(Role::Write), "report_write", None).unwrap_err();
        assert_eq!(err.reason(), "not_configured");
    }

    #[test]
    fn test_output_ceiling_takes_minimum() {
        let mut config = test_config();
        config.model_profiles.insert(
            "gpt-4o-mini".into(),
            ModelProfile {
                max_output_tokens: 16_384,
            },
        );
        config.token_caps.roles.insert(
            Role::Extract,
            RoleCaps {
                fast: Some(1_500),
                ..Default::default()
            },
        );

        let resolved =
            resolve_route(&config, Some(Role::Extract), "spec_extract_fast", None).unwrap();
        assert_eq!(resolved.max_output_tokens, 1_500);
    }

    #[test]
    fn test_compat_ceiling_applies_to_gemini() {
        let mut config = test_config();
        config.model_profiles.insert(
            "gemini-1.5-flash".into(),
            ModelProfile {
                max_output_tokens: 65_536,
            },
        );
        config.token_caps.roles.insert(
            Role::Plan,
            RoleCaps {
                reasoning: Some(32_768),
                ..Default::default()
            },
        );

        let resolved =
            resolve_route(&config, Some(Role::Plan), "plan_reasoning", None).unwrap();
        assert_eq!(resolved.max_output_tokens, COMPAT_OUTPUT_TOKENS);
    }

    #[test]
    fn test_clamp_max_tokens() {
        // Below the ceiling: honored as-is
        assert_eq!(clamp_max_tokens(Some(512), 2_048), 512);
        // Above the ceiling: clamped
        assert_eq!(clamp_max_tokens(Some(9_000), 2_048), 2_048);
        // Unspecified: the ceiling itself
        assert_eq!(clamp_max_tokens(None, 2_048), 2_048);
    }

    #[test]
    fn test_route_debug_masks_key() {
        let route = Route {
            role: Role::Extract,
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            base_url: "https://api.openai.com/v1".into(),
            api_key: "sk-1234567890abcdefghij".into(),
        };
        let debug_str = format!("{:?}", route);
        assert!(!debug_str.contains("567890abcdef"));
    }
}
