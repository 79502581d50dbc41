//! Classification: turn a parsed message into structured JSON via an LLM.
//!
//! Two depths of analysis sit behind the [`Classifier`] trait: a full
//! classification with a requirement verdict, and a lightweight digest
//! (3-line summary plus one category pick). The [`Analyzer`] builds the
//! provider selected by current settings on every call, so switching
//! between Claude and Ollama takes effect on the next batch.
//!
//! Model output is untrusted text: it is unwrapped from a markdown fence
//! if present, parsed, and validated; a failed attempt gets exactly one
//! fresh retry before the message is recorded as an analysis error.

mod claude;
mod ollama;
pub mod prompt;
mod provider;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

use async_trait::async_trait;

use crate::error::AnalysisError;
use crate::mailbox::parser::ParsedMessage;
use crate::settings::SettingsStore;

pub use self::claude::ClaudeProvider;
pub use self::ollama::OllamaProvider;
pub use self::provider::Provider;

/// Category recorded when the model cannot or will not pick one.
pub const UNCATEGORIZED: &str = "Uncategorized";

/// Attempts per classification before giving up (initial call + 1 retry).
const MAX_ATTEMPTS: u32 = 2;

// ── Classification types ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Small,
    Medium,
    Large,
    #[default]
    Undetermined,
}

impl Effort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effort::Small => "small",
            Effort::Medium => "medium",
            Effort::Large => "large",
            Effort::Undetermined => "undetermined",
        }
    }
}

/// Models emit these as free text; anything unrecognized falls back to
/// the default instead of failing the whole classification.
fn lenient_priority<'de, D>(de: D) -> Result<Priority, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(de)?;
    Ok(match raw.trim().to_lowercase().as_str() {
        "high" => Priority::High,
        "low" => Priority::Low,
        _ => Priority::Normal,
    })
}

fn lenient_effort<'de, D>(de: D) -> Result<Effort, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(de)?;
    Ok(match raw.trim().to_lowercase().as_str() {
        "small" => Effort::Small,
        "medium" => Effort::Medium,
        "large" => Effort::Large,
        _ => Effort::Undetermined,
    })
}

/// The structured verdict for one message. Field names match the JSON
/// contract given to the model.
///
/// `is_requirement` is the only field the model must provide; everything
/// else defaults so a sparse answer still validates, and normalization
/// guarantees the result is schema-complete either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    pub is_requirement: bool,
    #[serde(default)]
    pub category: String,
    #[serde(default, deserialize_with = "lenient_priority")]
    pub priority: Priority,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_requirements: Vec<String>,
    #[serde(default, deserialize_with = "lenient_effort")]
    pub estimated_effort: Effort,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub reasoning: String,
}

impl ClassificationResult {
    /// Fill the gaps a model may leave: a blank category becomes the
    /// sentinel so every persisted result carries one.
    fn normalized(mut self) -> Self {
        self.category = self.category.trim().to_string();
        if self.category.is_empty() {
            self.category = UNCATEGORIZED.to_string();
        }
        self
    }
}

/// A full classification plus which provider produced it.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub result: ClassificationResult,
    pub provider: String,
}

/// The lightweight digest used by the date-window path.
#[derive(Debug, Clone)]
pub struct Digest {
    pub summary: String,
    pub category: String,
    pub provider: String,
}

#[derive(Deserialize)]
struct DigestPayload {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    category: String,
}

// ── Classifier seam ─────────────────────────────────────────────────

/// What the pipeline needs from the analysis layer.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Full classification with the requirement verdict. Fails after the
    /// internal retry is exhausted.
    async fn classify(
        &self,
        msg: &ParsedMessage,
        categories: &[String],
    ) -> Result<Analysis, AnalysisError>;

    /// Summary plus single category pick. Falls back to a locally built
    /// digest rather than failing, so the date-window path always has
    /// something to deliver.
    async fn summarize(
        &self,
        msg: &ParsedMessage,
        categories: &[String],
    ) -> Result<Digest, AnalysisError>;
}

// ── JSON extraction ─────────────────────────────────────────────────

/// Unwrap a markdown code fence if the model wrapped its answer in one.
fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        let rest = rest.trim_start();
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim_end();
        }
        return rest;
    }
    trimmed
}

// ── Analyzer ────────────────────────────────────────────────────────

/// Settings-driven analysis orchestration over the [`Provider`] seam.
#[derive(Clone)]
pub struct Analyzer {
    settings: SettingsStore,
    client: reqwest::Client,
}

impl Analyzer {
    pub fn new(settings: SettingsStore) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
        }
    }

    /// Build the provider the current settings select. Never cached; a
    /// settings change is picked up by the next call.
    async fn provider(&self) -> Result<Box<dyn Provider>, AnalysisError> {
        let ai = self.settings.ai().await?;
        if ai.provider == "ollama" {
            Ok(Box::new(OllamaProvider::new(
                self.client.clone(),
                ai.ollama_host,
                ai.ollama_model,
            )))
        } else {
            if ai.claude_api_key.is_empty() {
                return Err(AnalysisError::NotConfigured {
                    provider: "claude".to_string(),
                });
            }
            Ok(Box::new(ClaudeProvider::new(
                self.client.clone(),
                SecretString::from(ai.claude_api_key),
                ai.claude_model,
            )))
        }
    }

    async fn attempt(
        provider: &dyn Provider,
        prompt: &str,
    ) -> Result<ClassificationResult, AnalysisError> {
        let raw = provider.analyze(prompt).await?;
        let json = extract_json(&raw);
        serde_json::from_str(json).map_err(|e| AnalysisError::InvalidResponse {
            provider: provider.name().to_string(),
            reason: format!("JSON did not match the expected shape: {}", e),
        })
    }

    /// Probe whichever provider the settings currently select.
    pub async fn test_connection(&self) -> Result<String, AnalysisError> {
        self.provider().await?.probe().await
    }
}

#[async_trait]
impl Classifier for Analyzer {
    async fn classify(
        &self,
        msg: &ParsedMessage,
        categories: &[String],
    ) -> Result<Analysis, AnalysisError> {
        let provider = self.provider().await?;
        let full_prompt = format!(
            "{}\n\n{}",
            prompt::classification_system(categories),
            prompt::classification_user(msg)
        );

        let mut last_error = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match Self::attempt(provider.as_ref(), &full_prompt).await {
                Ok(result) => {
                    return Ok(Analysis {
                        result: result.normalized(),
                        provider: provider.name().to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!("Classification attempt {} failed: {}", attempt, e);
                    last_error = e.to_string();
                }
            }
        }

        Err(AnalysisError::Exhausted {
            attempts: MAX_ATTEMPTS,
            last_error,
        })
    }

    async fn summarize(
        &self,
        msg: &ParsedMessage,
        categories: &[String],
    ) -> Result<Digest, AnalysisError> {
        let provider = match self.provider().await {
            Ok(provider) => provider,
            Err(e) => {
                tracing::warn!("No usable provider, building digest locally: {}", e);
                return Ok(local_digest(msg));
            }
        };

        let full_prompt = format!(
            "{}\n\n{}",
            prompt::digest_system(categories),
            prompt::digest_user(msg)
        );

        match provider.analyze(&full_prompt).await {
            Ok(raw) => match serde_json::from_str::<DigestPayload>(extract_json(&raw)) {
                Ok(payload) => Ok(Digest {
                    summary: if payload.summary.trim().is_empty() {
                        fallback_summary(msg)
                    } else {
                        payload.summary
                    },
                    // Only vocabulary members pass through; anything else
                    // becomes the sentinel.
                    category: if categories.contains(&payload.category) {
                        payload.category
                    } else {
                        UNCATEGORIZED.to_string()
                    },
                    provider: provider.name().to_string(),
                }),
                Err(e) => {
                    tracing::warn!("Digest response unusable, building locally: {}", e);
                    Ok(local_digest(msg))
                }
            },
            Err(e) => {
                tracing::warn!("Digest call failed, building locally: {}", e);
                Ok(local_digest(msg))
            }
        }
    }
}

/// Digest assembled without any model: the first lines of the body under
/// the sentinel category. Tagged `local` so the audit row shows no LLM ran.
fn local_digest(msg: &ParsedMessage) -> Digest {
    Digest {
        summary: fallback_summary(msg),
        category: UNCATEGORIZED.to_string(),
        provider: "local".to_string(),
    }
}

fn fallback_summary(msg: &ParsedMessage) -> String {
    let lines: Vec<&str> = msg
        .text_body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(3)
        .collect();
    if lines.is_empty() {
        msg.subject.clone()
    } else {
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn message(body: &str) -> ParsedMessage {
        ParsedMessage {
            uid: "u1".to_string(),
            message_id: "m1@test".to_string(),
            from: "alice@example.com".to_string(),
            to: "intake@company.com".to_string(),
            subject: "CSV export".to_string(),
            date: Utc::now(),
            text_body: body.to_string(),
            html_body: None,
            attachments: vec![],
        }
    }

    // ── JSON extraction ─────────────────────────────────────────────

    #[test]
    fn extract_json_passes_plain_json_through() {
        assert_eq!(extract_json(r#"{"a":1}"#), r#"{"a":1}"#);
        assert_eq!(extract_json("  {\"a\":1}\n"), r#"{"a":1}"#);
    }

    #[test]
    fn extract_json_unwraps_tagged_fence() {
        let raw = "```json\n{\"a\":1}\n```";
        assert_eq!(extract_json(raw), r#"{"a":1}"#);
    }

    #[test]
    fn extract_json_unwraps_bare_fence() {
        let raw = "```\n{\"a\":1}\n```";
        assert_eq!(extract_json(raw), r#"{"a":1}"#);
    }

    #[test]
    fn extract_json_tolerates_unterminated_fence() {
        let raw = "```json\n{\"a\":1}";
        assert_eq!(extract_json(raw), r#"{"a":1}"#);
    }

    // ── Result validation ───────────────────────────────────────────

    #[test]
    fn full_classification_parses() {
        let json = r#"{
            "isRequirement": true,
            "category": "Feature Request",
            "priority": "high",
            "title": "CSV export",
            "summary": "Customer wants CSV export.",
            "keyRequirements": ["export button", "CSV format"],
            "estimatedEffort": "medium",
            "tags": ["export", "reports"],
            "language": "en",
            "reasoning": "Asks for new functionality."
        }"#;

        let result: ClassificationResult = serde_json::from_str(json).unwrap();
        assert!(result.is_requirement);
        assert_eq!(result.priority, Priority::High);
        assert_eq!(result.estimated_effort, Effort::Medium);
        assert_eq!(result.key_requirements.len(), 2);
    }

    #[test]
    fn sparse_non_requirement_answer_is_schema_complete() {
        let result: ClassificationResult =
            serde_json::from_str::<ClassificationResult>(r#"{"isRequirement": false}"#)
                .unwrap()
                .normalized();

        assert!(!result.is_requirement);
        assert_eq!(result.category, UNCATEGORIZED);
        assert_eq!(result.priority, Priority::Normal);
        assert_eq!(result.estimated_effort, Effort::Undetermined);
        assert!(result.key_requirements.is_empty());
        assert!(result.tags.is_empty());
    }

    #[test]
    fn missing_verdict_is_a_parse_error() {
        let result = serde_json::from_str::<ClassificationResult>(r#"{"category": "Inquiry"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_priority_and_effort_fall_back() {
        let json = r#"{"isRequirement": true, "priority": "urgent!!", "estimatedEffort": "huge"}"#;
        let result: ClassificationResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.priority, Priority::Normal);
        assert_eq!(result.estimated_effort, Effort::Undetermined);
    }

    #[test]
    fn serialized_result_uses_camel_case() {
        let result: ClassificationResult =
            serde_json::from_str(r#"{"isRequirement": true}"#).unwrap();
        let value = serde_json::to_value(&result).unwrap();
        assert!(value.get("isRequirement").is_some());
        assert!(value.get("keyRequirements").is_some());
        assert_eq!(value["priority"], "normal");
    }

    // ── Local digest fallback ───────────────────────────────────────

    #[test]
    fn fallback_summary_takes_first_three_nonempty_lines() {
        let msg = message("\n\nfirst line\n\nsecond line\nthird line\nfourth line\n");
        assert_eq!(fallback_summary(&msg), "first line\nsecond line\nthird line");
    }

    #[test]
    fn fallback_summary_uses_subject_for_empty_body() {
        let msg = message("   \n\n  ");
        assert_eq!(fallback_summary(&msg), "CSV export");
    }

    #[test]
    fn local_digest_is_tagged_local_and_uncategorized() {
        let digest = local_digest(&message("body"));
        assert_eq!(digest.category, UNCATEGORIZED);
        assert_eq!(digest.provider, "local");
    }
}
