//! Circuit breaker with a per-provider registry
//!
//! Each remote provider gets its own breaker:
//! - Closed: normal operation, requests pass through
//! - Open: consecutive failures reached the threshold, requests are rejected
//! - HalfOpen: the cooldown elapsed, a single probe request is admitted
//!
//! The registry hands out one breaker per provider identity and is an owned,
//! injectable value, so independent pipelines (and tests) run isolated
//! breakers concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Failure threshold reached - requests are rejected
    Open,
    /// Cooldown elapsed - one probe request is admitted
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Duration to hold the circuit open before admitting a probe
    pub open_for: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_for: Duration::from_secs(60),
        }
    }
}

impl BreakerConfig {
    /// Create a new configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Coarser preset used for sidecar-style dependencies
    #[must_use]
    pub fn sidecar() -> Self {
        Self {
            failure_threshold: 3,
            open_for: Duration::from_secs(30),
        }
    }

    /// Set the failure threshold
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the open-state cooldown
    #[must_use]
    pub fn with_open_for(mut self, open_for: Duration) -> Self {
        self.open_for = open_for;
        self
    }
}

#[derive(Debug)]
enum Inner {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

/// Circuit breaker for a single provider identity
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, BreakerConfig::default())
    }

    /// Get the breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        match *self.inner.lock().expect("breaker lock poisoned") {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen => CircuitState::HalfOpen,
        }
    }

    /// Get the current consecutive-failure count
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        match *self.inner.lock().expect("breaker lock poisoned") {
            Inner::Closed { failures } => failures,
            _ => 0,
        }
    }

    /// Check whether a request may be attempted.
    ///
    /// Performs the open-to-half-open transition once the cooldown has
    /// elapsed. In half-open state exactly one probe is admitted; further
    /// requests are rejected until the probe's outcome is recorded.
    #[must_use]
    pub fn can_request(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match *inner {
            Inner::Closed { .. } => true,
            Inner::Open { until } => {
                if Instant::now() >= until {
                    info!(name = %self.name, "circuit breaker entering half-open state");
                    *inner = Inner::HalfOpen;
                    true
                } else {
                    false
                }
            }
            // A probe is already in flight
            Inner::HalfOpen => false,
        }
    }

    /// Record a successful request
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match *inner {
            Inner::Closed { failures } if failures > 0 => {
                *inner = Inner::Closed { failures: 0 };
            }
            Inner::HalfOpen => {
                info!(name = %self.name, "circuit breaker closed after successful probe");
                *inner = Inner::Closed { failures: 0 };
            }
            _ => {}
        }
    }

    /// Record a failed request
    pub fn record_failure(&self, reason: &str) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match *inner {
            Inner::Closed { failures } => {
                let failures = failures + 1;
                debug!(
                    name = %self.name,
                    failures,
                    threshold = self.config.failure_threshold,
                    reason,
                    "circuit breaker failure recorded"
                );
                if failures >= self.config.failure_threshold {
                    warn!(name = %self.name, failures, reason, "circuit breaker opened");
                    *inner = Inner::Open {
                        until: Instant::now() + self.config.open_for,
                    };
                } else {
                    *inner = Inner::Closed { failures };
                }
            }
            Inner::HalfOpen => {
                warn!(name = %self.name, reason, "circuit breaker probe failed, reopening");
                *inner = Inner::Open {
                    until: Instant::now() + self.config.open_for,
                };
            }
            Inner::Open { .. } => {}
        }
    }

    /// Reset the breaker to closed state
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        *inner = Inner::Closed { failures: 0 };
    }
}

/// Registry of circuit breakers keyed by provider identity.
///
/// Breakers are created lazily with the registry's configuration. The
/// registry is cheap to clone behind an `Arc` and holds no cross-key lock
/// beyond the map itself.
pub struct ProviderHealth {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl ProviderHealth {
    /// Create a registry with the given per-breaker configuration
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry with default breaker configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(BreakerConfig::default())
    }

    /// Get (or lazily create) the breaker for a provider
    #[must_use]
    pub fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .expect("registry lock poisoned")
            .get(provider)
        {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write().expect("registry lock poisoned");
        Arc::clone(breakers.entry(provider.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(provider, self.config.clone()))
        }))
    }

    /// Check whether a request to the provider may be attempted
    #[must_use]
    pub fn can_request(&self, provider: &str) -> bool {
        self.breaker(provider).can_request()
    }

    /// Record a successful request to the provider
    pub fn record_success(&self, provider: &str) {
        self.breaker(provider).record_success();
    }

    /// Record a failed request to the provider
    pub fn record_failure(&self, provider: &str, reason: &str) {
        self.breaker(provider).record_failure(reason);
    }

    /// Get the provider's current breaker state
    #[must_use]
    pub fn state(&self, provider: &str) -> CircuitState {
        self.breaker(provider).state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(threshold: u32) -> BreakerConfig {
        BreakerConfig::new()
            .with_failure_threshold(threshold)
            .with_open_for(Duration::from_millis(20))
    }

    #[test]
    fn test_initial_state() {
        let cb = CircuitBreaker::with_defaults("openai");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_request());
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let cb = CircuitBreaker::new("openai", fast_config(3));

        cb.record_failure("timeout");
        cb.record_failure("timeout");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_request());

        cb.record_failure("timeout");
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_request());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cb = CircuitBreaker::new("openai", fast_config(3));

        cb.record_failure("timeout");
        cb.record_failure("timeout");
        assert_eq!(cb.failure_count(), 2);

        cb.record_success();
        assert_eq!(cb.failure_count(), 0);

        cb.record_failure("timeout");
        cb.record_failure("timeout");
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let cb = CircuitBreaker::new("gemini", fast_config(1));

        cb.record_failure("network_error");
        assert!(!cb.can_request());

        std::thread::sleep(Duration::from_millis(30));

        // Exactly one probe passes; the next caller is rejected
        assert!(cb.can_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.can_request());
    }

    #[test]
    fn test_half_open_success_closes() {
        let cb = CircuitBreaker::new("gemini", fast_config(1));

        cb.record_failure("network_error");
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.can_request());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_request());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("gemini", fast_config(1));

        cb.record_failure("network_error");
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.can_request());

        cb.record_failure("timeout");
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_request());
    }

    #[test]
    fn test_reset() {
        let cb = CircuitBreaker::new("openai", fast_config(1));
        cb.record_failure("timeout");
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_request());
    }

    #[test]
    fn test_registry_keys_breakers_by_provider() {
        let health = ProviderHealth::new(fast_config(1));

        health.record_failure("openai", "timeout");
        assert!(!health.can_request("openai"));
        assert!(health.can_request("gemini"));
        assert_eq!(health.state("openai"), CircuitState::Open);
        assert_eq!(health.state("gemini"), CircuitState::Closed);
    }

    #[test]
    fn test_registry_concurrent_access() {
        let health = Arc::new(ProviderHealth::new(fast_config(100)));
        let mut handles = Vec::new();

        for i in 0..8 {
            let health = Arc::clone(&health);
            handles.push(std::thread::spawn(move || {
                let provider = if i % 2 == 0 { "openai" } else { "gemini" };
                for _ in 0..50 {
                    let _ = health.can_request(provider);
                    health.record_failure(provider, "timeout");
                    health.record_success(provider);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(health.state("openai"), CircuitState::Closed);
        assert_eq!(health.state("gemini"), CircuitState::Closed);
    }

    #[test]
    fn test_sidecar_preset() {
        let config = BreakerConfig::sidecar();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.open_for, Duration::from_secs(30));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(format!("{}", CircuitState::Closed), "Closed");
        assert_eq!(format!("{}", CircuitState::Open), "Open");
        assert_eq!(format!("{}", CircuitState::HalfOpen), "HalfOpen");
    }
}
