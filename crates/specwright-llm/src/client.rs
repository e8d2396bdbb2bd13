//! Structured call executor
//!
//! Turns a resolved route, prompt and optional output schema into a parsed,
//! schema-shaped result or a descriptive failure. The executor consults the
//! provider health registry before every attempt and records the outcome
//! after it; the wire itself sits behind a transport trait so tests script
//! responses without a network.

use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::images::resolve_images;
use crate::repair::{matches_shape, parse_model_json};
use crate::route::{clamp_max_tokens, Route};
use crate::trace::TraceLog;
use crate::usage::{estimate_tokens, CostRates, LlmUsage, UsageSink};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use specwright_core::{sanitize_api_error, scrub_secrets, ProviderHealth};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Default per-call timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Schema name sent with the response-format directive
const DEFAULT_SCHEMA_NAME: &str = "structured_output";

// ============================================================================
// Wire types (OpenAI-compatible chat completions)
// ============================================================================

/// Inline or remote image payload for a content part
#[derive(Debug, Clone, Serialize)]
pub struct ImageUrl {
    /// Data URI or remote URL
    pub url: String,
}

/// One part of a multipart user message
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text part
    Text {
        /// The text
        text: String,
    },
    /// Image part
    ImageUrl {
        /// The image payload
        image_url: ImageUrl,
    },
}

/// Message content: plain text or multipart
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ChatContent {
    /// Plain text content
    Text(String),
    /// Multipart content (text plus images)
    Parts(Vec<ContentPart>),
}

/// One request message
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    /// Message role ("system" or "user")
    pub role: String,
    /// Message content
    pub content: ChatContent,
}

/// Strict JSON-schema response directive
#[derive(Debug, Clone, Serialize)]
pub struct JsonSchemaSpec {
    /// Schema name
    pub name: String,
    /// Strict conformance flag
    pub strict: bool,
    /// The schema itself
    pub schema: Value,
}

/// `response_format` body
#[derive(Debug, Clone, Serialize)]
pub struct ResponseFormat {
    /// Always "json_schema"
    #[serde(rename = "type")]
    pub format_type: String,
    /// The schema directive
    pub json_schema: JsonSchemaSpec,
}

/// Chat-completions request body
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// Model name
    pub model: String,
    /// Always 0 for extraction determinism
    pub temperature: f32,
    /// System and user messages
    pub messages: Vec<ChatMessage>,
    /// Output-token cap
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Structured-output directive, when the provider supports it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

/// Cached-token detail inside the usage object
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptTokensDetails {
    /// Prompt tokens served from the provider's cache
    #[serde(default)]
    pub cached_tokens: Option<u32>,
}

/// Usage object of a chat-completions response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireUsage {
    /// Prompt tokens
    #[serde(default)]
    pub prompt_tokens: Option<u32>,
    /// Completion tokens
    #[serde(default)]
    pub completion_tokens: Option<u32>,
    /// Total tokens
    #[serde(default)]
    pub total_tokens: Option<u32>,
    /// Cached-token detail
    #[serde(default)]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
}

/// Response message; content may be a string or multipart-with-text
#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    /// Raw content value
    #[serde(default)]
    pub content: Option<Value>,
}

/// One response choice
#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    /// The message
    pub message: WireMessage,
}

/// Chat-completions response body
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    /// Response choices
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    /// Usage object, when the provider reports one
    #[serde(default)]
    pub usage: Option<WireUsage>,
    /// Model that actually served the call
    #[serde(default)]
    pub model: Option<String>,
}

// ============================================================================
// Transport
// ============================================================================

/// The wire seam: one chat-completions POST per call
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send one request to the route's endpoint under a timeout
    async fn send_chat(
        &self,
        route: &Route,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse>;
}

/// HTTPS transport over reqwest
pub struct HttpChatTransport {
    client: reqwest::Client,
}

impl Default for HttpChatTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpChatTransport {
    /// Create a transport with a shared connection pool
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl ChatTransport for HttpChatTransport {
    async fn send_chat(
        &self,
        route: &Route,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse> {
        let url = format!(
            "{}/chat/completions",
            route.base_url.trim_end_matches('/')
        );
        let secrets: &[&str] = &[route.api_key.as_str()];

        let attempt = async {
            let response = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", route.api_key))
                .header("Content-Type", "application/json")
                .json(request)
                .send()
                .await
                .map_err(|e| Error::Network(scrub_secrets(&e.to_string(), secrets)))?;

            if !response.status().is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::Api(sanitize_api_error(&scrub_secrets(
                    &body, secrets,
                ))));
            }

            response
                .json::<ChatResponse>()
                .await
                .map_err(|e| Error::InvalidResponse(scrub_secrets(&e.to_string(), secrets)))
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout.as_millis() as u64)),
        }
    }
}

// ============================================================================
// Call options and result
// ============================================================================

/// Options for one structured call
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Caller-supplied reason tag
    pub reason: String,
    /// System prompt
    pub system: String,
    /// User payload text
    pub user_text: String,
    /// Image entries (paths, data URIs or remote URLs)
    pub images: Vec<String>,
    /// Required output schema
    pub json_schema: Option<Value>,
    /// Requested output tokens (clamped to the route ceiling)
    pub max_tokens: Option<u32>,
    /// Augment the system prompt with a reasoning directive
    pub reasoning: bool,
    /// Token budget quoted in the reasoning directive
    pub reasoning_budget: Option<u32>,
    /// Per-call timeout
    pub timeout: Duration,
    /// Usage-context tag propagated onto the usage record
    pub usage_context: Option<String>,
}

impl CallOptions {
    /// Create options for a call
    #[must_use]
    pub fn new(
        reason: impl Into<String>,
        system: impl Into<String>,
        user_text: impl Into<String>,
    ) -> Self {
        Self {
            reason: reason.into(),
            system: system.into(),
            user_text: user_text.into(),
            images: Vec::new(),
            json_schema: None,
            max_tokens: None,
            reasoning: false,
            reasoning_budget: None,
            timeout: DEFAULT_TIMEOUT,
            usage_context: None,
        }
    }

    /// Require schema-conforming output
    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.json_schema = Some(schema);
        self
    }

    /// Attach image entries
    #[must_use]
    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    /// Request an output-token count
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Enable the reasoning directive with an optional budget
    #[must_use]
    pub fn with_reasoning(mut self, budget: Option<u32>) -> Self {
        self.reasoning = true;
        self.reasoning_budget = budget;
        self
    }

    /// Set the per-call timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Tag the usage record with caller context
    #[must_use]
    pub fn with_usage_context(mut self, context: impl Into<String>) -> Self {
        self.usage_context = Some(context.into());
        self
    }
}

/// Tags applied to an attempt's usage record by the orchestrator
#[derive(Debug, Clone, Default)]
pub struct AttemptTags {
    /// The attempt ran on the fallback route
    pub fallback_attempt: bool,
    /// Model of the failed primary route
    pub fallback_from_model: Option<String>,
}

/// A parsed, schema-shaped call result
#[derive(Debug, Clone)]
pub struct CallResult {
    /// Parsed JSON value
    pub parsed: Value,
    /// Raw textual content the value was parsed from
    pub raw_content: String,
    /// Usage record emitted for the call
    pub usage: LlmUsage,
    /// Model that served the call
    pub response_model: String,
}

// ============================================================================
// Executor
// ============================================================================

/// Whether the provider honors a strict `response_format` directive
#[must_use]
pub fn structured_output_supported(provider: &str) -> bool {
    matches!(provider, "openai" | "deepseek" | "openrouter" | "groq")
}

/// Whether an error indicates the provider rejected the schema directive
#[must_use]
pub fn is_schema_rejection(error: &Error) -> bool {
    let message = match error {
        Error::Api(m) | Error::InvalidResponse(m) => m.to_lowercase(),
        _ => return false,
    };
    ["response_format", "json_schema", "unsupported", "invalid parameter", "invalid_parameter"]
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Extract textual content from a response message's content value.
/// Multipart content contributes its text parts, joined by newlines.
#[must_use]
pub fn extract_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| {
                if part.get("type").and_then(Value::as_str) == Some("text") {
                    part.get("text").and_then(Value::as_str)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Executes structured calls against resolved routes
pub struct CallExecutor {
    transport: Arc<dyn ChatTransport>,
    health: Arc<ProviderHealth>,
    trace: Option<Arc<TraceLog>>,
    max_inline_images: usize,
    max_image_bytes: usize,
}

impl CallExecutor {
    /// Create an executor over a transport and a health registry
    #[must_use]
    pub fn new(transport: Arc<dyn ChatTransport>, health: Arc<ProviderHealth>) -> Self {
        Self {
            transport,
            health,
            trace: None,
            max_inline_images: crate::config::DEFAULT_MAX_INLINE_IMAGES,
            max_image_bytes: crate::config::DEFAULT_MAX_IMAGE_BYTES,
        }
    }

    /// Create an executor configured from an [`LlmConfig`]
    #[must_use]
    pub fn from_config(
        transport: Arc<dyn ChatTransport>,
        health: Arc<ProviderHealth>,
        config: &LlmConfig,
    ) -> Self {
        Self::new(transport, health)
            .with_image_limits(config.max_inline_images, config.max_image_bytes)
    }

    /// Attach a trace sink
    #[must_use]
    pub fn with_trace(mut self, trace: Arc<TraceLog>) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Override image limits
    #[must_use]
    pub fn with_image_limits(mut self, max_images: usize, max_bytes: usize) -> Self {
        self.max_inline_images = max_images;
        self.max_image_bytes = max_bytes;
        self
    }

    /// The provider health registry the executor consults
    #[must_use]
    pub fn health(&self) -> &Arc<ProviderHealth> {
        &self.health
    }

    /// Execute one structured call against a route.
    ///
    /// Performs at most two network attempts: with the schema directive and,
    /// if the provider rejects the directive itself, once more without it.
    /// Success and terminal failure are both recorded against the provider's
    /// circuit breaker.
    ///
    /// # Errors
    /// `CircuitOpen` when the provider's breaker rejects the attempt, then
    /// the transport/parse failures described in [`Error`].
    #[instrument(skip(self, opts, rates, sink), fields(provider = %route.provider, model = %route.model, reason = %opts.reason))]
    pub async fn execute(
        &self,
        route: &Route,
        ceiling: u32,
        opts: &CallOptions,
        rates: &CostRates,
        sink: Option<&UsageSink>,
        tags: AttemptTags,
    ) -> Result<CallResult> {
        if !self.health.can_request(&route.provider) {
            debug!("circuit open, call not attempted");
            return Err(Error::CircuitOpen(route.provider.clone()));
        }

        let outcome = self.execute_inner(route, ceiling, opts, rates, sink, tags).await;
        match &outcome {
            Ok(_) => self.health.record_success(&route.provider),
            Err(e) => self.health.record_failure(&route.provider, e.reason()),
        }

        if let Some(trace) = &self.trace {
            let prompt = format!("{}\n{}", opts.system, opts.user_text);
            let (outcome_tag, response) = match &outcome {
                Ok(result) => ("ok", result.raw_content.as_str()),
                Err(e) => (e.reason(), ""),
            };
            trace.record(
                &opts.reason,
                &route.provider,
                &route.model,
                outcome_tag,
                &prompt,
                response,
            );
        }

        outcome
    }

    async fn execute_inner(
        &self,
        route: &Route,
        ceiling: u32,
        opts: &CallOptions,
        rates: &CostRates,
        sink: Option<&UsageSink>,
        tags: AttemptTags,
    ) -> Result<CallResult> {
        let schema_capable = structured_output_supported(&route.provider);
        let messages = self.build_messages(opts, schema_capable);
        let max_tokens = clamp_max_tokens(opts.max_tokens, ceiling);

        let build_request = |with_schema: bool| ChatRequest {
            model: route.model.clone(),
            temperature: 0.0,
            messages: messages.clone(),
            max_tokens: Some(max_tokens),
            response_format: opts.json_schema.as_ref().filter(|_| with_schema).map(
                |schema| ResponseFormat {
                    format_type: "json_schema".to_string(),
                    json_schema: JsonSchemaSpec {
                        name: DEFAULT_SCHEMA_NAME.to_string(),
                        strict: true,
                        schema: schema.clone(),
                    },
                },
            ),
        };

        let with_schema = opts.json_schema.is_some() && schema_capable;
        let mut schema_fallback = false;
        let request = build_request(with_schema);
        let response = match self.transport.send_chat(route, &request, opts.timeout).await {
            Ok(response) => response,
            Err(e) if with_schema && is_schema_rejection(&e) => {
                // The directive itself was refused; the model may still
                // produce usable JSON from the instruction alone
                warn!(error = %e, "schema directive rejected, retrying without it");
                schema_fallback = true;
                let request = build_request(false);
                self.transport.send_chat(route, &request, opts.timeout).await?
            }
            Err(e) => return Err(e),
        };

        let content = extract_text(
            response
                .choices
                .first()
                .and_then(|choice| choice.message.content.as_ref()),
        );
        if content.trim().is_empty() {
            return Err(Error::EmptyContent);
        }

        let parsed = parse_model_json(&content)
            .ok_or_else(|| Error::Unparsable(format!("{} chars of content", content.len())))?;

        if let Some(schema) = &opts.json_schema {
            let mismatches = matches_shape(&parsed, schema);
            if !mismatches.is_empty() {
                warn!(?mismatches, "response shape does not match schema");
            }
        }

        let usage = self.build_usage(route, opts, &response, &content, rates, schema_fallback, tags);
        if let Some(sink) = sink {
            sink(&usage);
        }

        let response_model = response.model.unwrap_or_else(|| route.model.clone());
        Ok(CallResult {
            parsed,
            raw_content: content,
            usage,
            response_model,
        })
    }

    fn build_messages(&self, opts: &CallOptions, schema_capable: bool) -> Vec<ChatMessage> {
        let mut system = opts.system.clone();
        if opts.reasoning {
            system.push_str("\n\nReason through the evidence carefully before answering.");
            if let Some(budget) = opts.reasoning_budget {
                system.push_str(&format!(" Keep internal reasoning under {budget} tokens."));
            }
        }
        if opts.json_schema.is_some() && !schema_capable {
            system.push_str(
                "\n\nRespond with a single JSON value only. No prose, no code fences.",
            );
        }

        let image_urls = resolve_images(&opts.images, self.max_inline_images, self.max_image_bytes);
        let user_content = if image_urls.is_empty() {
            ChatContent::Text(opts.user_text.clone())
        } else {
            let mut parts = vec![ContentPart::Text {
                text: opts.user_text.clone(),
            }];
            parts.extend(
                image_urls
                    .into_iter()
                    .map(|url| ContentPart::ImageUrl {
                        image_url: ImageUrl { url },
                    }),
            );
            ChatContent::Parts(parts)
        };

        vec![
            ChatMessage {
                role: "system".to_string(),
                content: ChatContent::Text(system),
            },
            ChatMessage {
                role: "user".to_string(),
                content: user_content,
            },
        ]
    }

    #[allow(clippy::too_many_arguments)]
    fn build_usage(
        &self,
        route: &Route,
        opts: &CallOptions,
        response: &ChatResponse,
        content: &str,
        rates: &CostRates,
        schema_fallback: bool,
        tags: AttemptTags,
    ) -> LlmUsage {
        let wire = response.usage.clone().unwrap_or_default();
        let estimated = wire.prompt_tokens.is_none() || wire.completion_tokens.is_none();

        let prompt_tokens = wire.prompt_tokens.unwrap_or_else(|| {
            estimate_tokens(&opts.system) + estimate_tokens(&opts.user_text)
        });
        let completion_tokens = wire
            .completion_tokens
            .unwrap_or_else(|| estimate_tokens(content));
        let cached_prompt_tokens = wire
            .prompt_tokens_details
            .and_then(|details| details.cached_tokens)
            .unwrap_or(0);
        let total_tokens = wire
            .total_tokens
            .unwrap_or(prompt_tokens + completion_tokens);

        LlmUsage {
            provider: route.provider.clone(),
            model: route.model.clone(),
            prompt_tokens,
            completion_tokens,
            cached_prompt_tokens,
            total_tokens,
            cost_usd: rates.cost_usd(
                &route.model,
                prompt_tokens,
                cached_prompt_tokens,
                completion_tokens,
            ),
            estimated,
            schema_fallback,
            fallback_attempt: tags.fallback_attempt,
            fallback_from_model: tags.fallback_from_model,
            context: opts.usage_context.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use serde_json::json;
    use specwright_core::BreakerConfig;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn test_route(provider: &str, model: &str) -> Route {
        Route {
            role: Role::Extract,
            provider: provider.into(),
            model: model.into(),
            base_url: "https://api.example.com/v1".into(),
            api_key: "sk-test-key-1234567890".into(),
        }
    }

    fn chat_response(content: &str) -> ChatResponse {
        ChatResponse {
            choices: vec![ChatChoice {
                message: WireMessage {
                    content: Some(Value::String(content.to_string())),
                },
            }],
            usage: Some(WireUsage {
                prompt_tokens: Some(100),
                completion_tokens: Some(20),
                total_tokens: Some(120),
                prompt_tokens_details: None,
            }),
            model: Some("served-model".into()),
        }
    }

    /// Transport returning a scripted sequence and recording each request
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<ChatResponse>>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<ChatResponse>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn send_chat(
            &self,
            _route: &Route,
            request: &ChatRequest,
            _timeout: Duration,
        ) -> Result<ChatResponse> {
            self.requests.lock().unwrap().push(request.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(Error::Network("script exhausted".into())))
        }
    }

    fn executor(transport: Arc<ScriptedTransport>) -> CallExecutor {
        CallExecutor::new(
            transport,
            Arc::new(ProviderHealth::new(BreakerConfig::default())),
        )
    }

    fn options() -> CallOptions {
        CallOptions::new("spec_extract", "Extract fields.", "Sensor: 26,000 DPI")
            .with_schema(json!({"type": "object", "required": ["dpi"]}))
    }

    #[tokio::test]
    async fn test_successful_call_parses_and_reports_usage() {
        let transport = ScriptedTransport::new(vec![Ok(chat_response(r#"{"dpi": 26000}"#))]);
        let exec = executor(Arc::clone(&transport));

        let result = exec
            .execute(
                &test_route("openai", "gpt-4o-mini"),
                2048,
                &options(),
                &CostRates::default(),
                None,
                AttemptTags::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.parsed, json!({"dpi": 26000}));
        assert_eq!(result.response_model, "served-model");
        assert_eq!(result.usage.prompt_tokens, 100);
        assert!(!result.usage.estimated);
        assert!(!result.usage.schema_fallback);

        // Schema-capable provider gets the strict directive
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].response_format.is_some());
        assert_eq!(requests[0].temperature, 0.0);
    }

    #[tokio::test]
    async fn test_circuit_open_aborts_without_attempt() {
        let transport = ScriptedTransport::new(vec![Ok(chat_response("{}"))]);
        let exec = CallExecutor::new(
            Arc::clone(&transport) as Arc<dyn ChatTransport>,
            Arc::new(ProviderHealth::new(
                BreakerConfig::default().with_failure_threshold(1),
            )),
        );
        exec.health().record_failure("openai", "timeout");

        let err = exec
            .execute(
                &test_route("openai", "gpt-4o-mini"),
                2048,
                &options(),
                &CostRates::default(),
                None,
                AttemptTags::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.reason(), "circuit_open");
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_schema_rejection_retries_without_directive() {
        let transport = ScriptedTransport::new(vec![
            Err(Error::Api("response_format is not supported for this model".into())),
            Ok(chat_response(r#"{"dpi": 26000}"#)),
        ]);
        let exec = executor(Arc::clone(&transport));

        let result = exec
            .execute(
                &test_route("openai", "gpt-4o-mini"),
                2048,
                &options(),
                &CostRates::default(),
                None,
                AttemptTags::default(),
            )
            .await
            .unwrap();

        assert!(result.usage.schema_fallback);
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].response_format.is_some());
        assert!(requests[1].response_format.is_none());
    }

    #[tokio::test]
    async fn test_unrelated_failure_propagates_and_trips_breaker() {
        let transport = ScriptedTransport::new(vec![Err(Error::Timeout(5000))]);
        let exec = executor(Arc::clone(&transport));

        let err = exec
            .execute(
                &test_route("openai", "gpt-4o-mini"),
                2048,
                &options(),
                &CostRates::default(),
                None,
                AttemptTags::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.reason(), "timeout");
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(exec.health().breaker("openai").failure_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_content_fails() {
        let transport = ScriptedTransport::new(vec![Ok(chat_response("   "))]);
        let exec = executor(transport);

        let err = exec
            .execute(
                &test_route("openai", "gpt-4o-mini"),
                2048,
                &options(),
                &CostRates::default(),
                None,
                AttemptTags::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "empty_content");
    }

    #[tokio::test]
    async fn test_unparsable_content_fails() {
        let transport = ScriptedTransport::new(vec![Ok(chat_response("no json in sight"))]);
        let exec = executor(transport);

        let err = exec
            .execute(
                &test_route("openai", "gpt-4o-mini"),
                2048,
                &options(),
                &CostRates::default(),
                None,
                AttemptTags::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "unparsable_content");
    }

    #[tokio::test]
    async fn test_fenced_response_parses() {
        let transport = ScriptedTransport::new(vec![Ok(chat_response(
            "Here you go:\n```json\n{\"dpi\": 26000}\n```",
        ))]);
        let exec = executor(transport);

        let result = exec
            .execute(
                &test_route("openai", "gpt-4o-mini"),
                2048,
                &options(),
                &CostRates::default(),
                None,
                AttemptTags::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.parsed, json!({"dpi": 26000}));
    }

    #[tokio::test]
    async fn test_non_schema_provider_gets_json_instruction() {
        let transport = ScriptedTransport::new(vec![Ok(chat_response(r#"{"dpi": 26000}"#))]);
        let exec = executor(Arc::clone(&transport));

        exec.execute(
            &test_route("gemini", "gemini-1.5-flash"),
            2048,
            &options(),
            &CostRates::default(),
            None,
            AttemptTags::default(),
        )
        .await
        .unwrap();

        let requests = transport.requests();
        assert!(requests[0].response_format.is_none());
        match &requests[0].messages[0].content {
            ChatContent::Text(system) => assert!(system.contains("JSON value only")),
            ChatContent::Parts(_) => panic!("system message should be plain text"),
        }
    }

    #[tokio::test]
    async fn test_missing_usage_is_estimated() {
        let mut response = chat_response(r#"{"dpi": 26000}"#);
        response.usage = None;
        let transport = ScriptedTransport::new(vec![Ok(response)]);
        let exec = executor(transport);

        let result = exec
            .execute(
                &test_route("openai", "gpt-4o-mini"),
                2048,
                &options(),
                &CostRates::default(),
                None,
                AttemptTags::default(),
            )
            .await
            .unwrap();

        assert!(result.usage.estimated);
        assert!(result.usage.prompt_tokens > 0);
        assert!(result.usage.completion_tokens > 0);
    }

    #[tokio::test]
    async fn test_requested_tokens_clamped_to_ceiling() {
        let transport = ScriptedTransport::new(vec![Ok(chat_response(r#"{"dpi": 1}"#))]);
        let exec = executor(Arc::clone(&transport));

        let opts = options().with_max_tokens(9_000);
        exec.execute(
            &test_route("openai", "gpt-4o-mini"),
            2_048,
            &opts,
            &CostRates::default(),
            None,
            AttemptTags::default(),
        )
        .await
        .unwrap();

        assert_eq!(transport.requests()[0].max_tokens, Some(2_048));
    }

    #[tokio::test]
    async fn test_usage_sink_receives_record() {
        let transport = ScriptedTransport::new(vec![Ok(chat_response(r#"{"dpi": 1}"#))]);
        let exec = executor(transport);

        let received: Arc<Mutex<Vec<LlmUsage>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_records = Arc::clone(&received);
        let sink: UsageSink = Arc::new(move |usage: &LlmUsage| {
            sink_records.lock().unwrap().push(usage.clone());
        });

        exec.execute(
            &test_route("openai", "gpt-4o-mini"),
            2048,
            &options().with_usage_context("batch-42"),
            &CostRates::default(),
            Some(&sink),
            AttemptTags::default(),
        )
        .await
        .unwrap();

        let records = received.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].context.as_deref(), Some("batch-42"));
    }

    #[test]
    fn test_extract_text_multipart() {
        let content = json!([
            {"type": "text", "text": "part one"},
            {"type": "image_url", "image_url": {"url": "https://x"}},
            {"type": "text", "text": "part two"}
        ]);
        assert_eq!(extract_text(Some(&content)), "part one\npart two");
        assert_eq!(extract_text(None), "");
    }

    #[test]
    fn test_schema_rejection_detection() {
        assert!(is_schema_rejection(&Error::Api(
            "json_schema mode unsupported".into()
        )));
        assert!(is_schema_rejection(&Error::Api(
            "Invalid parameter: response_format".into()
        )));
        assert!(!is_schema_rejection(&Error::Api("rate limited".into())));
        assert!(!is_schema_rejection(&Error::Timeout(1000)));
    }
}
