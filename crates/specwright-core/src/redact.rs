//! Secret redaction for logs and error messages
//!
//! Every error message that might carry provider responses or request
//! context is scrubbed before it is logged or raised.

/// Minimum key length to display partial key
const MIN_KEY_LENGTH_FOR_PARTIAL_DISPLAY: usize = 8;

/// Number of characters to show at start/end of masked key
const KEY_MASK_VISIBLE_CHARS: usize = 4;

/// Maximum error text length before truncation
const MAX_ERROR_LENGTH: usize = 300;

/// Mask an API key for safe display in logs.
///
/// Shows first 4 and last 4 characters for keys longer than 8 characters,
/// otherwise shows "****".
#[must_use]
pub fn mask_api_key(key: &str) -> String {
    if key.len() <= MIN_KEY_LENGTH_FOR_PARTIAL_DISPLAY {
        return "****".to_string();
    }
    format!(
        "{}...{}",
        &key[..KEY_MASK_VISIBLE_CHARS],
        &key[key.len() - KEY_MASK_VISIBLE_CHARS..]
    )
}

/// Replace every occurrence of any known secret in a message.
///
/// Empty and trivially short secrets are ignored so a blank config value
/// cannot blank out the whole message.
#[must_use]
pub fn scrub_secrets(message: &str, secrets: &[&str]) -> String {
    let mut scrubbed = message.to_string();
    for secret in secrets {
        if secret.len() >= MIN_KEY_LENGTH_FOR_PARTIAL_DISPLAY {
            scrubbed = scrubbed.replace(secret, "[REDACTED]");
        }
    }
    scrubbed
}

/// Sanitize provider error text for storage and display.
///
/// Collapses authentication, rate-limit and server-error bodies to generic
/// messages and truncates anything overly long.
#[must_use]
pub fn sanitize_api_error(error: &str) -> String {
    let lower = error.to_lowercase();

    if lower.contains("api key")
        || lower.contains("apikey")
        || lower.contains("invalid key")
        || lower.contains("unauthorized")
        || lower.contains("authentication")
    {
        return "API authentication error. Please check your API key configuration.".to_string();
    }

    if lower.contains("rate limit") || lower.contains("quota") {
        return "API rate limit exceeded. Please try again later.".to_string();
    }

    if lower.contains("internal") || lower.contains("server error") {
        return "API server error. Please try again later.".to_string();
    }

    if error.len() > MAX_ERROR_LENGTH {
        let mut end = MAX_ERROR_LENGTH;
        while !error.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...(truncated)", &error[..end])
    } else {
        error.to_string()
    }
}
