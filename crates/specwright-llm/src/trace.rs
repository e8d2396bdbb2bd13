//! Ring-buffered call tracing
//!
//! Every executed call may leave one trace record. Full prompt/response text
//! is kept only under the explicit developer-mode flag; otherwise records
//! carry character counts alone, so traces stay safe to export.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default ring capacity
const DEFAULT_CAPACITY: usize = 256;

/// One traced call
#[derive(Debug, Clone, Serialize)]
pub struct TraceRecord {
    /// Record time
    pub timestamp: DateTime<Utc>,
    /// Caller-supplied reason
    pub reason: String,
    /// Provider attempted
    pub provider: String,
    /// Model attempted
    pub model: String,
    /// Outcome: "ok" or an error reason code
    pub outcome: String,
    /// Prompt length in characters
    pub prompt_chars: usize,
    /// Response length in characters
    pub response_chars: usize,
    /// Full prompt text (developer mode only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Full response text (developer mode only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

/// Fixed-capacity, redaction-aware trace sink
pub struct TraceLog {
    capacity: usize,
    dev_mode: bool,
    records: Mutex<VecDeque<TraceRecord>>,
}

impl TraceLog {
    /// Create a trace log. With `dev_mode` false, prompt/response text is
    /// reduced to character counts.
    #[must_use]
    pub fn new(capacity: usize, dev_mode: bool) -> Self {
        Self {
            capacity: capacity.max(1),
            dev_mode,
            records: Mutex::new(VecDeque::new()),
        }
    }

    /// Create with the default capacity
    #[must_use]
    pub fn with_defaults(dev_mode: bool) -> Self {
        Self::new(DEFAULT_CAPACITY, dev_mode)
    }

    /// Record one call, evicting the oldest record at capacity
    pub fn record(
        &self,
        reason: &str,
        provider: &str,
        model: &str,
        outcome: &str,
        prompt: &str,
        response: &str,
    ) {
        let record = TraceRecord {
            timestamp: Utc::now(),
            reason: reason.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            outcome: outcome.to_string(),
            prompt_chars: prompt.chars().count(),
            response_chars: response.chars().count(),
            prompt: self.dev_mode.then(|| prompt.to_string()),
            response: self.dev_mode.then(|| response.to_string()),
        };

        let mut records = self.records.lock().expect("trace lock poisoned");
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Snapshot the buffered records, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<TraceRecord> {
        self.records
            .lock()
            .expect("trace lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_text_outside_dev_mode() {
        let log = TraceLog::new(8, false);
        log.record("spec_extract", "openai", "gpt-4o-mini", "ok", "prompt text", "response");

        let records = log.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].prompt_chars, 11);
        assert_eq!(records[0].response_chars, 8);
        assert!(records[0].prompt.is_none());
        assert!(records[0].response.is_none());
    }

    #[test]
    fn test_keeps_text_in_dev_mode() {
        let log = TraceLog::new(8, true);
        log.record("spec_extract", "openai", "gpt-4o-mini", "timeout", "p", "r");

        let records = log.snapshot();
        assert_eq!(records[0].prompt.as_deref(), Some("p"));
        assert_eq!(records[0].response.as_deref(), Some("r"));
        assert_eq!(records[0].outcome, "timeout");
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let log = TraceLog::new(2, false);
        for reason in ["first", "second", "third"] {
            log.record(reason, "openai", "gpt-4o-mini", "ok", "", "");
        }

        let records = log.snapshot();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].reason, "second");
        assert_eq!(records[1].reason, "third");
    }
}
