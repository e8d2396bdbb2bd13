//! Evidence verification
//!
//! A model call proposes field candidates; nothing it claims is trusted
//! until the claim is textually grounded in the evidence snippet it cites.
//! Verification is pure and synchronous, short-circuiting on the first
//! failed check with a stable reason code.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// One evidence snippet the extraction was permitted to read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snippet {
    /// Snippet text
    pub text: String,
    /// Content hash at collection time
    pub hash: String,
}

/// One source reference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    /// Source URL
    pub url: String,
    /// Free-form source metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// The snippets and references an extraction was permitted to read.
/// Owned by the evidence-collection pipeline; read-only here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidencePack {
    /// Snippets by id
    #[serde(default)]
    pub snippets: HashMap<String, Snippet>,
    /// References by id
    #[serde(default)]
    pub references: HashMap<String, Reference>,
}

/// A field value a model proposed, with its claimed provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Field name
    pub field: String,
    /// Proposed value
    pub value: String,
    /// Ids of the evidence the value claims to come from
    #[serde(default)]
    pub evidence_refs: Vec<String>,
    /// Cited snippet id
    #[serde(default)]
    pub snippet_id: Option<String>,
    /// Snippet hash claimed at extraction time
    #[serde(default)]
    pub snippet_hash: Option<String>,
    /// Supporting quote claimed from the snippet
    #[serde(default)]
    pub quote: Option<String>,
    /// Character-offset span locating the quote inside the snippet
    #[serde(default)]
    pub quote_span: Option<(usize, usize)>,
}

/// Why a candidate was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No non-empty evidence reference ids
    MissingEvidenceRefs,
    /// The cited snippet id resolves to nothing
    SnippetNotFound,
    /// The claimed snippet hash differs from the pack's current hash
    SnippetHashMismatch,
    /// Snippet text or candidate value is empty after normalization
    SnippetOrValueMissing,
    /// The quote span is malformed or out of range
    QuoteSpanInvalid,
    /// The quote span denotes text other than the claimed quote
    QuoteSpanMismatch,
    /// The claimed quote does not occur in the snippet
    QuoteNotInSnippet,
    /// The value does not occur in the snippet
    ValueNotInSnippet,
    /// The value's leading numeral does not occur in the snippet
    NumericValueNotInSnippet,
}

impl Rejection {
    /// Stable reason code
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingEvidenceRefs => "missing_evidence_refs",
            Self::SnippetNotFound => "snippet_not_found",
            Self::SnippetHashMismatch => "snippet_hash_mismatch",
            Self::SnippetOrValueMissing => "snippet_or_value_missing",
            Self::QuoteSpanInvalid => "quote_span_invalid",
            Self::QuoteSpanMismatch => "quote_span_mismatch",
            Self::QuoteNotInSnippet => "quote_not_in_snippet",
            Self::ValueNotInSnippet => "value_not_in_snippet",
            Self::NumericValueNotInSnippet => "numeric_value_not_in_snippet",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercase and collapse whitespace runs for case/whitespace-insensitive
/// containment checks.
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn numeral_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d[\d,.]*\d|\d").expect("numeral regex"))
}

/// Strip digit grouping and a trailing decimal point from a numeral
fn normalize_numeral(numeral: &str) -> String {
    numeral.replace(',', "").trim_end_matches('.').to_string()
}

/// Leading numeral of a value, when the value is numeric-shaped
fn leading_numeral(value: &str) -> Option<String> {
    let trimmed = value.trim().trim_start_matches(['-', '+']);
    let m = numeral_regex().find(trimmed)?;
    if m.start() != 0 {
        return None;
    }
    Some(normalize_numeral(m.as_str()))
}

/// Find a numeral in the snippet whose digits equal `target`, returning
/// (matched text, char start, char end).
fn find_numeral(snippet: &str, target: &str) -> Option<(String, usize, usize)> {
    for m in numeral_regex().find_iter(snippet) {
        if normalize_numeral(m.as_str()) == target {
            let start = snippet[..m.start()].chars().count();
            let end = start + m.as_str().chars().count();
            return Some((m.as_str().to_string(), start, end));
        }
    }
    None
}

fn char_slice(text: &str, start: usize, end: usize) -> String {
    text.chars().take(end).skip(start).collect()
}

/// Prove or reject a proposed candidate against the evidence pack.
///
/// Checks run in a fixed order and short-circuit on the first failure. On
/// success the returned candidate carries the resolved snippet id, the
/// pack's current snippet hash and deduplicated references; when the value
/// matched through its numeral, a missing quote/span is auto-filled from
/// the matched location.
///
/// In non-strict mode a cited id resolving only to a reference (no snippet
/// body) is accepted; the text checks are skipped since there is no text to
/// check against.
pub fn verify_candidate(
    candidate: &Candidate,
    pack: &EvidencePack,
    strict: bool,
) -> Result<Candidate, Rejection> {
    // 1. At least one non-empty reference id
    let mut refs: Vec<String> = Vec::new();
    for id in &candidate.evidence_refs {
        let id = id.trim();
        if !id.is_empty() && !refs.iter().any(|existing| existing == id) {
            refs.push(id.to_string());
        }
    }
    if refs.is_empty() {
        return Err(Rejection::MissingEvidenceRefs);
    }

    // 2. Resolve the cited snippet
    let cited_ids: Vec<&str> = candidate
        .snippet_id
        .as_deref()
        .into_iter()
        .chain(refs.iter().map(String::as_str))
        .collect();
    let resolved = cited_ids
        .iter()
        .find_map(|id| pack.snippets.get(*id).map(|snippet| (*id, snippet)));

    let Some((snippet_id, snippet)) = resolved else {
        // Reference-only grounding: tolerated outside strict mode
        if !strict {
            if let Some(ref_id) = cited_ids.iter().find(|id| pack.references.contains_key(**id)) {
                let mut verified = candidate.clone();
                verified.snippet_id = Some((*ref_id).to_string());
                verified.snippet_hash = None;
                verified.evidence_refs = refs;
                return Ok(verified);
            }
        }
        return Err(Rejection::SnippetNotFound);
    };

    // 3. Evidence changed since extraction
    if let Some(claimed) = candidate.snippet_hash.as_deref() {
        if !claimed.is_empty() && !snippet.hash.is_empty() && claimed != snippet.hash {
            return Err(Rejection::SnippetHashMismatch);
        }
    }

    // 4. Nothing to ground, or nothing to ground against
    let snippet_norm = normalize(&snippet.text);
    let value_norm = normalize(&candidate.value);
    if snippet_norm.is_empty() || value_norm.is_empty() {
        return Err(Rejection::SnippetOrValueMissing);
    }

    // 5. Span, when given, must be well-formed and denote the claimed quote
    if let Some((start, end)) = candidate.quote_span {
        let snippet_chars = snippet.text.chars().count();
        if start >= end || end > snippet_chars {
            return Err(Rejection::QuoteSpanInvalid);
        }
        let Some(quote) = candidate.quote.as_deref() else {
            return Err(Rejection::QuoteSpanInvalid);
        };
        let span_text = char_slice(&snippet.text, start, end);
        if normalize(&span_text) != normalize(quote) {
            return Err(Rejection::QuoteSpanMismatch);
        }
    }

    // 6. Quote, when given, must occur in the snippet
    if let Some(quote) = candidate.quote.as_deref() {
        let quote_norm = normalize(quote);
        if quote_norm.is_empty() || !snippet_norm.contains(&quote_norm) {
            return Err(Rejection::QuoteNotInSnippet);
        }
    }

    // 7. The value itself must be grounded
    let mut verified = candidate.clone();
    if !snippet_norm.contains(&value_norm) {
        let Some(numeral) = leading_numeral(&candidate.value) else {
            return Err(Rejection::ValueNotInSnippet);
        };
        let Some((matched, start, end)) = find_numeral(&snippet.text, &numeral) else {
            return Err(Rejection::NumericValueNotInSnippet);
        };
        if verified.quote.is_none() {
            verified.quote = Some(matched);
        }
        if verified.quote_span.is_none() {
            verified.quote_span = Some((start, end));
        }
    }

    verified.snippet_id = Some(snippet_id.to_string());
    verified.snippet_hash = Some(snippet.hash.clone());
    verified.evidence_refs = refs;
    Ok(verified)
}
