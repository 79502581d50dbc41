//! Ollama backend: self-hosted inference over the local chat API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::analysis::provider::{Provider, SYSTEM_INSTRUCTION};
use crate::error::AnalysisError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const TAGS_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OllamaProvider {
    client: reqwest::Client,
    host: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(client: reqwest::Client, host: String, model: String) -> Self {
        Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            model,
        }
    }

    fn request_failed(&self, reason: String) -> AnalysisError {
        AnalysisError::RequestFailed {
            provider: self.name().to_string(),
            reason,
        }
    }

    /// List the model names the server advertises.
    async fn advertised_models(&self) -> Result<Vec<String>, AnalysisError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.host))
            .timeout(TAGS_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.request_failed(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(self.request_failed(format!("Ollama returned {}: {}", status, body)));
        }

        let tags: TagsResponse =
            response
                .json()
                .await
                .map_err(|e| AnalysisError::InvalidResponse {
                    provider: self.name().to_string(),
                    reason: format!("Failed to parse response: {}", e),
                })?;

        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

/// True when `want` matches an advertised model exactly or as a prefix
/// (`gemma3` matches `gemma3:12b`).
fn model_available(advertised: &[String], want: &str) -> bool {
    advertised
        .iter()
        .any(|name| name == want || name.starts_with(want))
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    /// `"json"` forces valid JSON output.
    format: &'static str,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    name: String,
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn analyze(&self, prompt: &str) -> Result<String, AnalysisError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_INSTRUCTION.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            format: "json",
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.host))
            .timeout(REQUEST_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.request_failed(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(self.request_failed(format!("Ollama returned {}: {}", status, body)));
        }

        let result: ChatResponse =
            response
                .json()
                .await
                .map_err(|e| AnalysisError::InvalidResponse {
                    provider: self.name().to_string(),
                    reason: format!("Failed to parse response: {}", e),
                })?;

        Ok(result.message.content)
    }

    /// Reaches `/api/tags` and cross-checks that the configured model is
    /// actually served, reporting what is available when it is not.
    async fn probe(&self) -> Result<String, AnalysisError> {
        let advertised = self.advertised_models().await?;
        if !model_available(&advertised, &self.model) {
            let available = if advertised.is_empty() {
                "none".to_string()
            } else {
                advertised.join(", ")
            };
            return Err(AnalysisError::ModelNotAvailable {
                provider: self.name().to_string(),
                model: self.model.clone(),
                available,
            });
        }

        Ok(format!(
            "Connected to Ollama. Model \"{}\" is available.",
            self.model
        ))
    }
}
