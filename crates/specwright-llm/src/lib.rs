//! Reliability layer for structured LLM calls.
//!
//! Routes each call to a provider by role and reason, executes it with
//! JSON repair and schema-shape checking, falls back to a second route on
//! failure, verifies extracted values against their claimed evidence, and
//! accounts for every token spent. Providers sit behind one OpenAI-compatible
//! chat-completions wire; per-provider circuit breakers keep a failing
//! provider from stalling the pipeline.
//!
//! The usual entry point is [`LlmRouter::call_with_routing`]; the pieces
//! underneath (route resolution, the call executor, the evidence verifier)
//! are public for hosts that compose them differently.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
pub mod evidence;
pub mod images;
pub mod orchestrator;
pub mod repair;
pub mod route;
pub mod trace;
pub mod usage;

pub use client::{
    CallExecutor, CallOptions, CallResult, ChatTransport, HttpChatTransport,
};
pub use config::{LlmConfig, Role, RouteConfig};
pub use error::{Error, Result};
pub use evidence::{Candidate, EvidencePack, Rejection, Snippet};
pub use orchestrator::{CachePolicy, LlmRouter};
pub use route::{resolve_route, ResolvedRoute, Route};
pub use trace::{TraceLog, TraceRecord};
pub use usage::{CostRates, LlmUsage, UsageLedger, UsageSink, UsageStats};
