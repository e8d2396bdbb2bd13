//! Usage records, cost rates and aggregate accounting

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Characters per token for the estimate fallback when a provider omits usage
const CHARS_PER_TOKEN: usize = 4;

/// Default USD rates per 1M tokens for models without an entry
const DEFAULT_INPUT_PER_MILLION: f64 = 5.0;
const DEFAULT_CACHED_INPUT_PER_MILLION: f64 = 2.5;
const DEFAULT_OUTPUT_PER_MILLION: f64 = 15.0;

/// Estimate a token count from text length.
///
/// Used only when the provider response carries no usage object; records
/// built this way are flagged `estimated`.
#[must_use]
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() / CHARS_PER_TOKEN).max(1) as u32
}

/// USD rates per 1M tokens for one model
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelRates {
    /// Input (prompt) rate
    pub input_per_million: f64,
    /// Cached-input rate
    pub cached_input_per_million: f64,
    /// Output (completion) rate
    pub output_per_million: f64,
}

impl Default for ModelRates {
    fn default() -> Self {
        Self {
            input_per_million: DEFAULT_INPUT_PER_MILLION,
            cached_input_per_million: DEFAULT_CACHED_INPUT_PER_MILLION,
            output_per_million: DEFAULT_OUTPUT_PER_MILLION,
        }
    }
}

/// Cost-rate table keyed by model name, with a default for unknown models.
/// Maintained outside this subsystem; consumed read-only here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostRates {
    /// Per-model rates
    #[serde(default)]
    pub models: HashMap<String, ModelRates>,
    /// Rates applied to models without an entry
    #[serde(default)]
    pub fallback: ModelRates,
}

impl CostRates {
    /// Compute the dollar cost of a call
    #[must_use]
    pub fn cost_usd(
        &self,
        model: &str,
        prompt_tokens: u32,
        cached_prompt_tokens: u32,
        completion_tokens: u32,
    ) -> f64 {
        let rates = self.models.get(model).unwrap_or(&self.fallback);
        let fresh_prompt = prompt_tokens.saturating_sub(cached_prompt_tokens);
        (f64::from(fresh_prompt) / 1_000_000.0) * rates.input_per_million
            + (f64::from(cached_prompt_tokens) / 1_000_000.0) * rates.cached_input_per_million
            + (f64::from(completion_tokens) / 1_000_000.0) * rates.output_per_million
    }
}

/// One call's usage and cost record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmUsage {
    /// Provider that served the call
    pub provider: String,
    /// Model that served the call
    pub model: String,
    /// Prompt tokens
    pub prompt_tokens: u32,
    /// Completion tokens
    pub completion_tokens: u32,
    /// Prompt tokens served from the provider's cache
    pub cached_prompt_tokens: u32,
    /// Total tokens
    pub total_tokens: u32,
    /// Dollar cost under the caller's rate table
    pub cost_usd: f64,
    /// Token counts were estimated from text length
    pub estimated: bool,
    /// The call retried without the schema directive
    pub schema_fallback: bool,
    /// The call ran on the fallback route
    pub fallback_attempt: bool,
    /// Model of the failed primary route, when `fallback_attempt`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_from_model: Option<String>,
    /// Caller-supplied usage context tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Record time
    pub timestamp: DateTime<Utc>,
}

/// Caller sink receiving each usage record as it is emitted
pub type UsageSink = Arc<dyn Fn(&LlmUsage) + Send + Sync>;

/// Aggregate totals per provider or model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    /// Total prompt + completion tokens
    pub total_tokens: u64,
    /// Total cost in USD
    pub total_cost_usd: f64,
    /// Number of calls
    pub call_count: u64,
}

/// Aggregated usage statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStats {
    /// Overall totals
    pub overall: UsageTotals,
    /// Totals by provider
    pub by_provider: HashMap<String, UsageTotals>,
    /// Totals by model
    pub by_model: HashMap<String, UsageTotals>,
    /// Calls that ran on a fallback route
    pub fallback_calls: u64,
    /// Calls with estimated token counts
    pub estimated_calls: u64,
}

/// In-memory aggregation of usage records for reporting
#[derive(Default)]
pub struct UsageLedger {
    stats: Mutex<UsageStats>,
}

impl UsageLedger {
    /// Create an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one usage record into the aggregates
    pub fn record(&self, usage: &LlmUsage) {
        let mut guard = self.stats.lock().expect("ledger lock poisoned");
        let stats = &mut *guard;
        let tokens = u64::from(usage.total_tokens);

        let add = |totals: &mut UsageTotals| {
            totals.total_tokens += tokens;
            totals.total_cost_usd += usage.cost_usd;
            totals.call_count += 1;
        };
        add(&mut stats.overall);
        add(stats.by_provider.entry(usage.provider.clone()).or_default());
        add(stats.by_model.entry(usage.model.clone()).or_default());

        if usage.fallback_attempt {
            stats.fallback_calls += 1;
        }
        if usage.estimated {
            stats.estimated_calls += 1;
        }
    }

    /// Snapshot the aggregates
    #[must_use]
    pub fn stats(&self) -> UsageStats {
        self.stats.lock().expect("ledger lock poisoned").clone()
    }
}
