//! Routing orchestrator
//!
//! Ties resolution, caching and execution together: resolve the route for a
//! call, serve it from the response cache when the caller opted in, attempt
//! the primary route, and on failure attempt the distinct fallback route
//! exactly once. Every fallback attempt is tagged on its usage record.

use crate::client::{AttemptTags, CallExecutor, CallOptions, CallResult, ChatTransport, HttpChatTransport};
use crate::config::{LlmConfig, Role, DEFAULT_OUTPUT_TOKENS};
use crate::error::Result;
use crate::route::resolve_route;
use crate::trace::TraceLog;
use crate::usage::{CostRates, LlmUsage, UsageSink};
use chrono::Utc;
use serde_json::Value;
use specwright_core::{cache_key, BreakerConfig, ProviderHealth, ResponseCache};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Provider name reported on usage records for cache-served calls
pub const CACHE_PROVIDER: &str = "cache";

/// Opt-in caching for one call: where to look, how long to keep, and what
/// identity the prompt was built from.
#[derive(Clone)]
pub struct CachePolicy {
    /// The cache to consult
    pub cache: Arc<ResponseCache>,
    /// Lifetime for entries written by this call
    pub ttl_ms: u64,
    /// (reference id, content hash) pairs the prompt was built from
    pub evidence: Vec<(String, String)>,
    /// Additional caller context pairs
    pub extra: Vec<(String, String)>,
}

impl CachePolicy {
    /// Create a policy over a cache with the given TTL
    #[must_use]
    pub fn new(cache: Arc<ResponseCache>, ttl_ms: u64) -> Self {
        Self {
            cache,
            ttl_ms,
            evidence: Vec::new(),
            extra: Vec::new(),
        }
    }

    /// Attach evidence identity pairs
    #[must_use]
    pub fn with_evidence(mut self, evidence: Vec<(String, String)>) -> Self {
        self.evidence = evidence;
        self
    }

    /// Attach extra context pairs
    #[must_use]
    pub fn with_extra(mut self, extra: Vec<(String, String)>) -> Self {
        self.extra = extra;
        self
    }
}

/// Routed entry point for structured calls
pub struct LlmRouter {
    config: LlmConfig,
    executor: CallExecutor,
    rates: CostRates,
    sink: Option<UsageSink>,
}

impl LlmRouter {
    /// Create a router over HTTPS with its own health registry and trace log
    #[must_use]
    pub fn new(config: LlmConfig) -> Self {
        Self::with_transport(config, Arc::new(HttpChatTransport::new()))
    }

    /// Create a router over an explicit transport
    #[must_use]
    pub fn with_transport(config: LlmConfig, transport: Arc<dyn ChatTransport>) -> Self {
        let breaker = BreakerConfig::new()
            .with_failure_threshold(config.breaker.failure_threshold)
            .with_open_for(Duration::from_millis(config.breaker.open_ms));
        let health = Arc::new(ProviderHealth::new(breaker));
        let trace = Arc::new(TraceLog::with_defaults(config.dev_mode));
        let executor = CallExecutor::from_config(transport, health, &config).with_trace(trace);

        Self {
            config,
            executor,
            rates: CostRates::default(),
            sink: None,
        }
    }

    /// Set the cost-rate table applied to usage records
    #[must_use]
    pub fn with_rates(mut self, rates: CostRates) -> Self {
        self.rates = rates;
        self
    }

    /// Attach a sink receiving every usage record
    #[must_use]
    pub fn with_usage_sink(mut self, sink: UsageSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// The provider health registry behind this router
    #[must_use]
    pub fn health(&self) -> &Arc<ProviderHealth> {
        self.executor.health()
    }

    /// Execute a structured call with routing, caching and single fallback.
    ///
    /// The route is resolved from `{role, reason, model_override}`. With a
    /// cache policy, a fresh entry short-circuits the call and comes back
    /// with provider [`CACHE_PROVIDER`] on its usage record. Otherwise the
    /// primary route is attempted; on any failure the distinct fallback
    /// route (when configured) is attempted once, its usage tagged with
    /// `fallback_attempt` and the primary's model. Successful results are
    /// written back to the cache.
    ///
    /// # Errors
    /// Resolution errors, then the last attempt's error when every route
    /// failed.
    #[instrument(skip(self, opts, cache), fields(reason = %opts.reason))]
    pub async fn call_with_routing(
        &self,
        role: Option<Role>,
        model_override: Option<&str>,
        opts: &CallOptions,
        cache: Option<&CachePolicy>,
    ) -> Result<CallResult> {
        let resolved = resolve_route(&self.config, role, &opts.reason, model_override)?;

        let key = cache.map(|policy| {
            cache_key(
                &resolved.primary.model,
                &format!("{}\n{}", opts.system, opts.user_text),
                &policy.evidence,
                &policy.extra,
            )
        });
        if let (Some(policy), Some(key)) = (cache, key.as_deref()) {
            if let Some(value) = policy.cache.get(key).await {
                debug!(model = %resolved.primary.model, "served from response cache");
                return Ok(self.cached_result(&resolved.primary.model, value, opts));
            }
        }

        let sink = self.sink.as_ref();
        let primary_outcome = self
            .executor
            .execute(
                &resolved.primary,
                resolved.max_output_tokens,
                opts,
                &self.rates,
                sink,
                AttemptTags::default(),
            )
            .await;

        let result = match primary_outcome {
            Ok(result) => result,
            Err(primary_err) => {
                let Some(fallback) = &resolved.fallback else {
                    return Err(primary_err);
                };
                warn!(
                    error = %primary_err,
                    fallback_provider = %fallback.provider,
                    fallback_model = %fallback.model,
                    "primary route failed, attempting fallback"
                );
                let ceiling = resolved
                    .fallback_max_output_tokens
                    .unwrap_or(DEFAULT_OUTPUT_TOKENS);
                let tags = AttemptTags {
                    fallback_attempt: true,
                    fallback_from_model: Some(resolved.primary.model.clone()),
                };
                self.executor
                    .execute(fallback, ceiling, opts, &self.rates, sink, tags)
                    .await
                    .map_err(|fallback_err| {
                        warn!(
                            primary = %primary_err,
                            fallback = %fallback_err,
                            "fallback route also failed"
                        );
                        fallback_err
                    })?
            }
        };

        if let (Some(policy), Some(key)) = (cache, key) {
            policy.cache.set(&key, result.parsed.clone(), policy.ttl_ms).await;
        }
        Ok(result)
    }

    fn cached_result(&self, model: &str, value: Value, opts: &CallOptions) -> CallResult {
        let raw_content = value.to_string();
        CallResult {
            parsed: value,
            raw_content,
            usage: LlmUsage {
                provider: CACHE_PROVIDER.to_string(),
                model: model.to_string(),
                prompt_tokens: 0,
                completion_tokens: 0,
                cached_prompt_tokens: 0,
                total_tokens: 0,
                cost_usd: 0.0,
                estimated: false,
                schema_fallback: false,
                fallback_attempt: false,
                fallback_from_model: None,
                context: opts.usage_context.clone(),
                timestamp: Utc::now(),
            },
            response_model: model.to_string(),
        }
    }
}
