//! Claude backend: hosted Messages API.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::analysis::provider::{Provider, SYSTEM_INSTRUCTION};
use crate::error::AnalysisError;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 2048;
const PROBE_MAX_TOKENS: u32 = 50;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct ClaudeProvider {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
}

impl ClaudeProvider {
    pub fn new(client: reqwest::Client, api_key: SecretString, model: String) -> Self {
        Self {
            client,
            api_key,
            model,
        }
    }

    fn request_failed(&self, reason: String) -> AnalysisError {
        AnalysisError::RequestFailed {
            provider: self.name().to_string(),
            reason,
        }
    }

    /// Send one Messages API request and return the first text block.
    async fn send(&self, request: &MessagesRequest<'_>) -> Result<String, AnalysisError> {
        let response = self
            .client
            .post(API_URL)
            .timeout(REQUEST_TIMEOUT)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(request)
            .send()
            .await
            .map_err(|e| self.request_failed(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(self.request_failed(format!("Claude returned {}: {}", status, body)));
        }

        let result: MessagesResponse = response.json().await.map_err(|e| {
            AnalysisError::InvalidResponse {
                provider: self.name().to_string(),
                reason: format!("Failed to parse response: {}", e),
            }
        })?;

        result
            .content
            .into_iter()
            .find(|block| block.kind == "text")
            .and_then(|block| block.text)
            .ok_or_else(|| AnalysisError::InvalidResponse {
                provider: "claude".to_string(),
                reason: "no text block in response".to_string(),
            })
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl Provider for ClaudeProvider {
    fn name(&self) -> &str {
        "claude"
    }

    async fn analyze(&self, prompt: &str) -> Result<String, AnalysisError> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system: Some(SYSTEM_INSTRUCTION),
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };
        self.send(&request).await
    }

    async fn probe(&self) -> Result<String, AnalysisError> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: PROBE_MAX_TOKENS,
            system: None,
            messages: vec![Message {
                role: "user",
                content: "Respond with \"ok\"",
            }],
        };
        let reply = self.send(&request).await?;
        Ok(format!(
            "Connected to Claude ({}). Response: {}",
            self.model,
            reply.trim()
        ))
    }
}
