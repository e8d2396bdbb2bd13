//! Configuration types for routing and execution
//!
//! These are plain serde types; loading them from files is the host's
//! concern. Only environment-variable fallbacks for provider credentials
//! are resolved inside this crate, at route-resolution time.

use serde::{Deserialize, Serialize};
use specwright_core::mask_api_key;
use std::collections::HashMap;
use std::fmt;

/// Default output-token cap when neither profile nor role cap applies
pub const DEFAULT_OUTPUT_TOKENS: u32 = 4_096;

/// Output-token ceiling for providers that do not honor arbitrary limits
pub const COMPAT_OUTPUT_TOKENS: u32 = 8_192;

/// Default number of inline images accepted per call
pub const DEFAULT_MAX_INLINE_IMAGES: usize = 4;

/// Default per-image size ceiling in bytes
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 4 * 1024 * 1024;

/// Coarse call purpose driving default routing and token ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Discovery and planning calls
    Plan,
    /// Field extraction calls
    Extract,
    /// Validation and verification calls
    Validate,
    /// Report/content authoring calls
    Write,
}

/// Substring rules mapping free-form reason strings to roles.
/// First match wins, so the most specific reasons come first.
const ROLE_RULES: &[(&str, Role)] = &[
    ("discovery_planner", Role::Plan),
    ("verify_extract_fast", Role::Plan),
    ("plan", Role::Plan),
    ("author", Role::Write),
    ("write", Role::Write),
    ("validate", Role::Validate),
    ("verify", Role::Validate),
    ("extract", Role::Extract),
];

impl Role {
    /// Returns the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Extract => "extract",
            Self::Validate => "validate",
            Self::Write => "write",
        }
    }

    /// Map a free-form reason string to a role.
    ///
    /// Reasons matching no rule default to `Extract`, the dominant caller.
    #[must_use]
    pub fn from_reason(reason: &str) -> Self {
        let lower = reason.to_lowercase();
        for (needle, role) in ROLE_RULES {
            if lower.contains(needle) {
                return *role;
            }
        }
        Self::Extract
    }
}

/// Reason group for per-group output-token caps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasonGroup {
    /// Cheap, short triage calls
    Triage,
    /// Latency-sensitive fast-path calls
    Fast,
    /// Long-form reasoning calls
    Reasoning,
    /// Everything else
    Default,
}

impl ReasonGroup {
    /// Classify a reason string into its cap group
    #[must_use]
    pub fn from_reason(reason: &str) -> Self {
        let lower = reason.to_lowercase();
        if lower.contains("triage") {
            Self::Triage
        } else if lower.contains("fast") {
            Self::Fast
        } else if lower.contains("reason") || lower.contains("deep") {
            Self::Reasoning
        } else {
            Self::Default
        }
    }
}

/// Output-token caps for one role, by reason group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleCaps {
    /// Cap for triage-group reasons
    #[serde(default)]
    pub triage: Option<u32>,
    /// Cap for fast-group reasons
    #[serde(default)]
    pub fast: Option<u32>,
    /// Cap for reasoning-group reasons
    #[serde(default)]
    pub reasoning: Option<u32>,
    /// Cap for everything else
    #[serde(default)]
    pub default: Option<u32>,
}

impl RoleCaps {
    fn cap(&self, group: ReasonGroup) -> Option<u32> {
        match group {
            ReasonGroup::Triage => self.triage,
            ReasonGroup::Fast => self.fast,
            ReasonGroup::Reasoning => self.reasoning,
            ReasonGroup::Default => self.default,
        }
    }
}

/// Per-role and per-reason-group output-token cap table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenCaps {
    /// Per-role overrides
    #[serde(default)]
    pub roles: HashMap<Role, RoleCaps>,
}

impl TokenCaps {
    /// Built-in cap for a reason group when no role override applies
    #[must_use]
    pub fn builtin_cap(group: ReasonGroup) -> u32 {
        match group {
            ReasonGroup::Triage => 1_024,
            ReasonGroup::Fast => 2_048,
            ReasonGroup::Reasoning => 8_192,
            ReasonGroup::Default => DEFAULT_OUTPUT_TOKENS,
        }
    }

    /// Resolve the cap for a role and reason group
    #[must_use]
    pub fn cap(&self, role: Role, group: ReasonGroup) -> u32 {
        self.roles
            .get(&role)
            .and_then(|caps| caps.cap(group))
            .unwrap_or_else(|| Self::builtin_cap(group))
    }
}

/// Per-model execution profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Maximum output tokens the model supports
    pub max_output_tokens: u32,
}

/// Fallback route settings for a role.
///
/// The provider may be omitted; it is then inferred from the model name.
#[derive(Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Provider name (inferred from the model when absent)
    #[serde(default)]
    pub provider: Option<String>,
    /// Model name
    pub model: String,
    /// Base URL override
    #[serde(default)]
    pub base_url: Option<String>,
    /// API key override
    #[serde(default)]
    pub api_key: Option<String>,
}

impl fmt::Debug for FallbackConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                &self.api_key.as_deref().map(mask_api_key),
            )
            .finish()
    }
}

/// Primary route settings for a role
#[derive(Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Provider name
    pub provider: String,
    /// Model name
    pub model: String,
    /// Base URL override
    #[serde(default)]
    pub base_url: Option<String>,
    /// API key override
    #[serde(default)]
    pub api_key: Option<String>,
    /// Optional fallback route
    #[serde(default)]
    pub fallback: Option<FallbackConfig>,
}

impl fmt::Debug for RouteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                &self.api_key.as_deref().map(mask_api_key),
            )
            .field("fallback", &self.fallback)
            .finish()
    }
}

/// Circuit breaker tuning for provider calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Cooldown in milliseconds before admitting a probe
    pub open_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_ms: 60_000,
        }
    }
}

/// Top-level configuration for the LLM layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Route settings per role
    pub roles: HashMap<Role, RouteConfig>,
    /// Output-token cap table
    #[serde(default)]
    pub token_caps: TokenCaps,
    /// Per-model profiles
    #[serde(default)]
    pub model_profiles: HashMap<String, ModelProfile>,
    /// Circuit breaker tuning
    #[serde(default)]
    pub breaker: BreakerSettings,
    /// Developer mode: trace records keep full prompt/response text
    #[serde(default)]
    pub dev_mode: bool,
    /// Maximum inline images per call
    #[serde(default = "default_max_inline_images")]
    pub max_inline_images: usize,
    /// Per-image size ceiling in bytes
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
}

fn default_max_inline_images() -> usize {
    DEFAULT_MAX_INLINE_IMAGES
}

fn default_max_image_bytes() -> usize {
    DEFAULT_MAX_IMAGE_BYTES
}

impl LlmConfig {
    /// Create a configuration with the given role table and defaults elsewhere
    #[must_use]
    pub fn new(roles: HashMap<Role, RouteConfig>) -> Self {
        Self {
            roles,
            token_caps: TokenCaps::default(),
            model_profiles: HashMap::new(),
            breaker: BreakerSettings::default(),
            dev_mode: false,
            max_inline_images: DEFAULT_MAX_INLINE_IMAGES,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}
