//! Specwright Core - shared infrastructure
//!
//! This crate provides the infrastructure leaves used by the LLM layer:
//! - Breaker: per-provider circuit breaker with a keyed registry
//! - Cache: content-addressed response cache with TTL expiry
//! - Redact: API key masking and secret scrubbing for logs and errors

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod breaker;
pub mod cache;
pub mod redact;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState, ProviderHealth};
pub use cache::{cache_key, CacheEntry, CacheStore, MemoryStore, ResponseCache};
pub use redact::{mask_api_key, sanitize_api_error, scrub_secrets};
