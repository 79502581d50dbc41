//! Notion delivery: classified messages become database pages.
//!
//! Two page shapes behind the [`DocumentSink`] seam: the full classified
//! page (properties plus structured child blocks, used by the
//! classification path and reprocessing) and the lighter digest page the
//! date-window path writes. Every text field is clipped to Notion's
//! per-field limit before submission; clipping truncates, never errors.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::analysis::{ClassificationResult, Digest};
use crate::error::DeliveryError;
use crate::mailbox::parser::ParsedMessage;
use crate::settings::SettingsStore;

const API_BASE: &str = "https://api.notion.com/v1";
const API_VERSION: &str = "2022-06-28";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Notion caps rich text at 2000 characters per field.
const TEXT_CAP: usize = 2000;

/// Pause between page creation and the content append, to stay under
/// the API rate limit. A throttle, not a retry.
const RATE_LIMIT_DELAY: Duration = Duration::from_millis(350);

/// Identity of a created page.
#[derive(Debug, Clone)]
pub struct PageRef {
    pub id: String,
    pub url: String,
}

/// Where classified messages get delivered.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Create the full classified page with child content blocks.
    async fn create_page(
        &self,
        msg: &ParsedMessage,
        analysis: &ClassificationResult,
    ) -> Result<PageRef, DeliveryError>;

    /// Create the simple digest page used by the date-window path.
    async fn create_digest_page(
        &self,
        msg: &ParsedMessage,
        digest: &Digest,
    ) -> Result<PageRef, DeliveryError>;
}

/// Truncate to at most `cap` characters. Never fails, never splits a
/// code point.
fn clip(text: &str, cap: usize) -> String {
    text.chars().take(cap).collect()
}

fn text_block(content: &str) -> Value {
    json!([{ "type": "text", "text": { "content": content } }])
}

#[derive(Deserialize)]
struct PageResponse {
    id: String,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct DatabaseResponse {
    #[serde(default)]
    title: Vec<RichTextItem>,
}

#[derive(Deserialize)]
struct RichTextItem {
    #[serde(default)]
    plain_text: String,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// Settings-driven Notion API client.
#[derive(Clone)]
pub struct NotionClient {
    settings: SettingsStore,
    client: reqwest::Client,
}

impl NotionClient {
    pub fn new(settings: SettingsStore) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
        }
    }

    /// Current credentials, or `NotConfigured` when either is missing.
    async fn credentials(&self) -> Result<(String, String), DeliveryError> {
        let settings = self
            .settings
            .notion()
            .await
            .map_err(|e| DeliveryError::Http(e.to_string()))?;
        if !settings.is_configured() {
            return Err(DeliveryError::NotConfigured);
        }
        Ok((settings.api_key, settings.database_id))
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        api_key: &str,
    ) -> Result<reqwest::Response, DeliveryError> {
        let response = request
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(api_key)
            .header("Notion-Version", API_VERSION)
            .send()
            .await
            .map_err(|e| DeliveryError::Http(e.to_string()))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        // The API wraps errors in JSON; fall back to the raw body.
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|e| e.message)
            .unwrap_or(body);
        Err(DeliveryError::Api { status, message })
    }

    async fn create(&self, api_key: &str, body: Value) -> Result<PageRef, DeliveryError> {
        let response = self
            .send(
                self.client.post(format!("{API_BASE}/pages")).json(&body),
                api_key,
            )
            .await?;

        let page: PageResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::Http(format!("Failed to parse response: {}", e)))?;

        let url = page
            .url
            .unwrap_or_else(|| format!("https://notion.so/{}", page.id.replace('-', "")));
        Ok(PageRef { id: page.id, url })
    }

    /// Retrieve the configured database and report its title.
    pub async fn test_connection(&self) -> Result<String, DeliveryError> {
        let (api_key, database_id) = self.credentials().await?;
        let response = self
            .send(
                self.client
                    .get(format!("{API_BASE}/databases/{database_id}")),
                &api_key,
            )
            .await?;

        let database: DatabaseResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::Http(format!("Failed to parse response: {}", e)))?;

        let title = database
            .title
            .first()
            .map(|t| t.plain_text.as_str())
            .filter(|t| !t.is_empty())
            .unwrap_or("Unknown");
        Ok(format!("Connected to Notion database: \"{title}\""))
    }
}

/// The rich-text property content for a full classified page.
fn classified_text_content(msg: &ParsedMessage, analysis: &ClassificationResult) -> String {
    let mut parts = vec![
        format!("[Summary] {}", analysis.summary),
        String::new(),
        format!("Priority: {}", analysis.priority.as_str()),
        format!("Effort: {}", analysis.estimated_effort.as_str()),
        format!("From: {}", msg.from),
        String::new(),
        "[Key Requirements]".to_string(),
    ];
    for req in &analysis.key_requirements {
        parts.push(format!("• {req}"));
    }
    parts.push(String::new());
    parts.push(format!("[Tags] {}", analysis.tags.join(", ")));
    parts.push(format!("[Reasoning] {}", analysis.reasoning));
    clip(&parts.join("\n"), TEXT_CAP)
}

/// Child blocks appended under a full classified page.
fn classified_children(msg: &ParsedMessage, analysis: &ClassificationResult) -> Vec<Value> {
    let mut children = vec![
        json!({
            "object": "block",
            "type": "heading_2",
            "heading_2": { "rich_text": text_block("Summary") }
        }),
        json!({
            "object": "block",
            "type": "paragraph",
            "paragraph": { "rich_text": text_block(&clip(&analysis.summary, TEXT_CAP)) }
        }),
        json!({
            "object": "block",
            "type": "heading_2",
            "heading_2": { "rich_text": text_block("Key Requirements") }
        }),
    ];

    for req in &analysis.key_requirements {
        children.push(json!({
            "object": "block",
            "type": "bulleted_list_item",
            "bulleted_list_item": { "rich_text": text_block(&clip(req, TEXT_CAP)) }
        }));
    }

    children.push(json!({
        "object": "block",
        "type": "callout",
        "callout": {
            "rich_text": text_block(&clip(&analysis.reasoning, TEXT_CAP)),
            "icon": { "type": "emoji", "emoji": "💡" },
            "color": "blue_background"
        }
    }));

    children.push(json!({
        "object": "block",
        "type": "toggle",
        "toggle": {
            "rich_text": text_block("Original email"),
            "children": [{
                "object": "block",
                "type": "paragraph",
                "paragraph": { "rich_text": text_block(&clip(&msg.text_body, TEXT_CAP)) }
            }]
        }
    }));

    children
}

/// The rich-text property content for a digest page: summary on top,
/// then sender and a body preview, all within one field cap.
fn digest_text_content(msg: &ParsedMessage, digest: &Digest) -> String {
    let header = format!("[Summary]\n{}\n\nFrom: {}\n\n", digest.summary, msg.from);
    let remaining = TEXT_CAP.saturating_sub(header.chars().count());
    let preview = clip(&msg.text_body, remaining);
    clip(&format!("{header}{preview}"), TEXT_CAP)
}

#[async_trait]
impl DocumentSink for NotionClient {
    async fn create_page(
        &self,
        msg: &ParsedMessage,
        analysis: &ClassificationResult,
    ) -> Result<PageRef, DeliveryError> {
        let (api_key, database_id) = self.credentials().await?;

        let title = if analysis.title.is_empty() {
            &msg.subject
        } else {
            &analysis.title
        };

        let page = self
            .create(
                &api_key,
                json!({
                    "parent": { "database_id": database_id },
                    "properties": {
                        "Name": { "title": text_block(&clip(title, TEXT_CAP)) },
                        "Category": { "select": { "name": analysis.category } },
                        "Status": { "select": { "name": "New" } },
                        "Date": { "date": { "start": msg.date.format("%Y-%m-%d").to_string() } },
                        "Text": { "rich_text": text_block(&classified_text_content(msg, analysis)) }
                    }
                }),
            )
            .await?;

        tokio::time::sleep(RATE_LIMIT_DELAY).await;

        self.send(
            self.client
                .patch(format!("{API_BASE}/blocks/{}/children", page.id))
                .json(&json!({ "children": classified_children(msg, analysis) })),
            &api_key,
        )
        .await?;

        tracing::info!("Notion page created: {}", page.id);
        Ok(page)
    }

    async fn create_digest_page(
        &self,
        msg: &ParsedMessage,
        digest: &Digest,
    ) -> Result<PageRef, DeliveryError> {
        let (api_key, database_id) = self.credentials().await?;

        let page = self
            .create(
                &api_key,
                json!({
                    "parent": { "database_id": database_id },
                    "properties": {
                        "Name": { "title": text_block(&clip(&msg.subject, TEXT_CAP)) },
                        "Status": { "select": { "name": "Todo" } },
                        "Date": { "date": { "start": msg.date.format("%Y-%m-%d").to_string() } },
                        "Category": { "select": { "name": digest.category } },
                        "Text": { "rich_text": text_block(&digest_text_content(msg, digest)) }
                    }
                }),
            )
            .await?;

        tracing::info!("Notion digest page created: {}", page.id);
        Ok(page)
    }
}
