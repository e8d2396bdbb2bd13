//! Layered repair of semi-structured model output
//!
//! Models often emit scratch text, thinking tags or fenced code around the
//! JSON they were asked for. Repair runs an ordered list of candidate
//! producers and keeps the last candidate that parses; the later producers
//! cut closer to the final answer, so the last parseable one wins.

use serde_json::Value;
use tracing::debug;

/// Thinking delimiters some models leak into their output
const THINKING_TAGS: &[&str] = &["think", "thinking", "reasoning"];

/// Parse model output into JSON via the repair ladder.
///
/// Candidates, in order: the raw content; the content with thinking blocks
/// stripped; the first fenced code block; the first balanced brace/bracket
/// region of the thinking-stripped content. The last candidate that parses
/// wins.
#[must_use]
pub fn parse_model_json(content: &str) -> Option<Value> {
    let mut candidates: Vec<String> = vec![content.trim().to_string()];
    let stripped = strip_thinking(content);
    if let Some(stripped) = &stripped {
        candidates.push(stripped.clone());
    }
    if let Some(fenced) = first_fenced_block(content) {
        candidates.push(fenced);
    }
    // Scan with thinking blocks removed so scratch JSON inside them cannot
    // shadow the final answer
    let region_source = stripped.as_deref().unwrap_or(content);
    if let Some(region) = first_balanced_region(region_source) {
        candidates.push(region);
    }

    let mut parsed = None;
    for candidate in &candidates {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            parsed = Some(value);
        }
    }
    if parsed.is_none() {
        debug!(
            candidates = candidates.len(),
            content_chars = content.chars().count(),
            "no repair candidate parsed as JSON"
        );
    }
    parsed
}

/// Remove `<think>`/`<thinking>`/`<reasoning>` blocks.
///
/// Returns `None` when the content carries no thinking delimiters.
#[must_use]
pub fn strip_thinking(content: &str) -> Option<String> {
    let mut stripped = content.to_string();
    let mut changed = false;

    for tag in THINKING_TAGS {
        let open = format!("<{tag}>");
        let close = format!("</{tag}>");
        while let Some(start) = stripped.find(&open) {
            match stripped[start..].find(&close) {
                Some(rel_end) => {
                    stripped.replace_range(start..start + rel_end + close.len(), "");
                }
                // Unterminated block: keep only what follows the opening tag
                None => {
                    stripped.replace_range(start..start + open.len(), "");
                }
            }
            changed = true;
        }
    }

    changed.then(|| stripped.trim().to_string())
}

/// Extract the body of the first fenced code block, tolerating a language
/// tag after the opening fence.
#[must_use]
pub fn first_fenced_block(content: &str) -> Option<String> {
    let start = content.find("```")?;
    let after_fence = &content[start + 3..];
    // Skip the language tag line, if any
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim().to_string())
}

/// Extract the first balanced `{...}` or `[...]` region, tracking string
/// literals and escapes so braces inside strings do not count.
#[must_use]
pub fn first_balanced_region(content: &str) -> Option<String> {
    let bytes = content.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{' || b == b'[')?;
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(content[start..=start + offset].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Structurally validate a value against a JSON schema: container kind and
/// required-key presence only. Returns human-readable mismatches; an empty
/// list means the shape conforms.
#[must_use]
pub fn matches_shape(value: &Value, schema: &Value) -> Vec<String> {
    let mut mismatches = Vec::new();

    match schema.get("type").and_then(Value::as_str) {
        Some("object") => {
            if !value.is_object() {
                mismatches.push(format!(
                    "expected object, got {}",
                    container_kind(value)
                ));
            } else if let Some(required) = schema.get("required").and_then(Value::as_array) {
                for key in required.iter().filter_map(Value::as_str) {
                    if value.get(key).is_none() {
                        mismatches.push(format!("missing required key: {key}"));
                    }
                }
            }
        }
        Some("array") => {
            if !value.is_array() {
                mismatches.push(format!("expected array, got {}", container_kind(value)));
            }
        }
        _ => {}
    }

    mismatches
}

fn container_kind(value: &Value) -> &'static str {
    match value {
        Value::Object(_) => "object",
        Value::Array(_) => "array",
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Null => "null",
    }
}
