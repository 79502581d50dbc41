//! Prompt construction for classification and digest calls.
//!
//! Prompts are parameterized by the current category vocabulary so that
//! category edits take effect on the next batch without a restart.

use crate::mailbox::parser::ParsedMessage;

/// Body excerpt limit for the full classification prompt.
pub const MAX_BODY_CHARS: usize = 3000;

/// Body excerpt limit for the lightweight digest prompt.
pub const MAX_DIGEST_BODY_CHARS: usize = 1500;

const TRUNCATION_MARKER: &str = "...(truncated)";

/// Truncate `text` to at most `max_chars` characters, appending a marker
/// when anything was cut. Character-based, never splits a code point.
pub fn truncate_body(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

fn category_list(categories: &[String]) -> String {
    if categories.is_empty() {
        "Uncategorized".to_string()
    } else {
        categories.join(", ")
    }
}

/// System prompt for the full classification call. Demands JSON-only
/// output matching the classification shape.
pub fn classification_system(categories: &[String]) -> String {
    format!(
        "You are an email analysis assistant for a product team. You decide whether \
an inbound email describes a product requirement (a feature request, bug report, \
or improvement) and classify it. Respond with valid JSON only — no prose, no \
markdown fences.

Return exactly this JSON object:
{{
  \"isRequirement\": true or false,
  \"category\": one of [{categories}], or \"Uncategorized\" if none fits,
  \"priority\": \"high\", \"normal\" or \"low\",
  \"title\": a short title for the request,
  \"summary\": a 2-3 sentence summary,
  \"keyRequirements\": concrete requirements as an array of strings,
  \"estimatedEffort\": \"small\", \"medium\", \"large\" or \"undetermined\",
  \"tags\": an array of short keyword tags,
  \"language\": ISO 639-1 code of the email's language,
  \"reasoning\": one sentence explaining the verdict
}}

Every field must be present even when isRequirement is false.",
        categories = category_list(categories)
    )
}

/// User prompt for the full classification call.
pub fn classification_user(msg: &ParsedMessage) -> String {
    format!(
        "From: {}\nSubject: {}\nDate: {}\n\n{}",
        msg.from,
        msg.subject,
        msg.date.to_rfc3339(),
        truncate_body(&msg.text_body, MAX_BODY_CHARS)
    )
}

/// System prompt for the digest call: 3-line summary plus one category.
pub fn digest_system(categories: &[String]) -> String {
    format!(
        "You summarize inbound emails. Respond with valid JSON only — no prose, \
no markdown fences.

Return exactly this JSON object:
{{
  \"summary\": a summary of at most 3 short lines,
  \"category\": the single best fit from [{categories}], or \"Uncategorized\"
}}",
        categories = category_list(categories)
    )
}

/// User prompt for the digest call.
pub fn digest_user(msg: &ParsedMessage) -> String {
    format!(
        "From: {}\nSubject: {}\n\n{}",
        msg.from,
        msg.subject,
        truncate_body(&msg.text_body, MAX_DIGEST_BODY_CHARS)
    )
}
