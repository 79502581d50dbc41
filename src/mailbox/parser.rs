//! MIME parsing: raw POP3 payloads into structured messages.
//!
//! Thin layer over `mail_parser` that normalizes the fields the rest of
//! the pipeline cares about. Prefers the plain-text body; falls back to
//! stripped HTML so the classifier always has something to read.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use serde::Serialize;

use crate::error::ParseError;
use crate::mailbox::RawMessage;

/// Attachment metadata. Contents are never kept; the pipeline only
/// reports what was attached.
#[derive(Debug, Clone, Serialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
}

/// A fully parsed inbound message, ready for classification.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub uid: String,
    pub message_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub text_body: String,
    pub html_body: Option<String>,
    pub attachments: Vec<Attachment>,
}

/// Parse a raw message. Fails only when the payload is not recognizable
/// as a MIME message at all; individual missing fields get defaults.
pub fn parse(raw: &RawMessage) -> Result<ParsedMessage, ParseError> {
    let parsed =
        MessageParser::default()
            .parse(raw.payload.as_bytes())
            .ok_or(ParseError::Structure {
                uid: raw.uid.clone(),
            })?;

    let from = extract_address(parsed.from());
    let to = extract_address(parsed.to());
    let subject = parsed.subject().unwrap_or("(no subject)").to_string();
    let date = extract_date(&parsed);
    let html_body = parsed.body_html(0).map(|html| html.to_string());
    let text_body = extract_text(&parsed);

    let mut attachments = Vec::new();
    for part in parsed.attachments() {
        let filename = part.attachment_name().unwrap_or("unnamed").to_string();
        let content_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());
        attachments.push(Attachment {
            filename,
            content_type,
            size: part.contents().len(),
        });
    }

    Ok(ParsedMessage {
        uid: raw.uid.clone(),
        message_id: raw.message_id.clone(),
        from,
        to,
        subject,
        date,
        text_body,
        html_body,
        attachments,
    })
}

/// First address of a header as `Name <addr>`, or just the address when
/// no display name is present.
fn extract_address(header: Option<&mail_parser::Address>) -> String {
    header
        .and_then(|addr| addr.first())
        .map(|a| {
            let address = a.address().unwrap_or("");
            match a.name() {
                Some(name) if !name.is_empty() => format!("{name} <{address}>"),
                _ => address.to_string(),
            }
        })
        .unwrap_or_default()
}

/// Header date as UTC, or the current time when absent or invalid. The
/// header's timezone offset is folded in via the epoch timestamp.
fn extract_date(parsed: &mail_parser::Message) -> DateTime<Utc> {
    parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now)
}

/// Readable body text: the plain part if present, otherwise stripped HTML.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return html_to_text(html.as_ref());
    }
    String::new()
}

/// Strip HTML down to readable text (basic): drops script/style blocks,
/// removes tags, decodes the common entities, normalizes whitespace.
pub fn html_to_text(html: &str) -> String {
    // Remove script and style blocks before tag stripping. ASCII-only
    // lowercasing keeps byte offsets aligned with the original.
    let lowered = html.to_ascii_lowercase();
    let mut cleaned = String::with_capacity(html.len());
    let mut pos = 0;
    while pos < html.len() {
        let next_block = ["<script", "<style"]
            .iter()
            .filter_map(|open| lowered[pos..].find(open).map(|i| (pos + i, *open)))
            .min_by_key(|(i, _)| *i);
        match next_block {
            Some((start, open)) => {
                cleaned.push_str(&html[pos..start]);
                let close = if open == "<script" {
                    "</script>"
                } else {
                    "</style>"
                };
                match lowered[start..].find(close) {
                    Some(end) => pos = start + end + close.len(),
                    None => {
                        pos = html.len();
                    }
                }
            }
            None => {
                cleaned.push_str(&html[pos..]);
                pos = html.len();
            }
        }
    }

    let mut result = String::new();
    let mut in_tag = false;
    for ch in cleaned.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }

    let decoded = result
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    // Normalize whitespace
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}
