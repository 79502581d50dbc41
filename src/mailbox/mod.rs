//! Mailbox access: POP3 fetch strategies with retry and dedup awareness.
//!
//! The [`Mailbox`] trait is the async seam the pipeline consumes. The
//! default implementation, [`Pop3Mailbox`], reads its connection settings
//! fresh from the settings store on every call, runs a blocking POP3
//! session on the blocking pool, and retries transient failures with
//! exponential backoff. Fetch strategies are generic over [`Pop3Io`] so
//! they can be exercised against scripted sessions.

pub mod parser;
mod pop3;

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use secrecy::SecretString;

use crate::error::MailError;
use crate::settings::SettingsStore;
use crate::store::RecordStore;

pub use self::pop3::Pop3Config;
use self::pop3::{Pop3Io, Pop3Session};

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 1000;

static MESSAGE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^message-id:\s*<?([^>\r\n]+)>?").unwrap());

static DATE_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^date:\s*(.+)$").unwrap());

/// A message pulled off the server, not yet parsed.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Server-assigned unique id (UIDL).
    pub uid: String,
    /// RFC 5322 Message-ID, or `uid-{uid}` when the header is absent.
    pub message_id: String,
    /// Full message text as received.
    pub payload: String,
}

/// Async mail source the pipeline pulls from.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// All messages on the server whose UID has no processed record yet.
    async fn fetch_unseen(&self) -> Result<Vec<RawMessage>, MailError>;

    /// Unseen messages whose Date header is at or after `since`. Headers
    /// are inspected with TOP first so older mail is never downloaded.
    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<RawMessage>, MailError>;

    /// A single message by UID, or `None` if the server no longer has it.
    async fn fetch_by_uid(&self, uid: &str) -> Result<Option<RawMessage>, MailError>;
}

/// Pull the Message-ID header out of a raw payload, falling back to a
/// UID-derived identity so dedup still works for broken senders.
pub(crate) fn extract_message_id(payload: &str, uid: &str) -> String {
    MESSAGE_ID_RE
        .captures(payload)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("uid-{uid}"))
}

/// Parse the Date header out of a header block, if present and valid.
fn header_date(headers: &str) -> Option<DateTime<Utc>> {
    let raw = DATE_HEADER_RE.captures(headers)?.get(1)?.as_str().trim();
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Download every listed message not already in `seen`. A failed RETR
/// skips that message rather than aborting the whole scan.
fn scan_unseen<S: Pop3Io>(
    session: &mut S,
    seen: &HashSet<String>,
) -> Result<Vec<RawMessage>, MailError> {
    let listing = session.uidl()?;
    let mut messages = Vec::new();
    for (seq, uid) in listing {
        if seen.contains(&uid) {
            continue;
        }
        let payload = match session.retr(seq) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Failed to retrieve message {}: {}", uid, e);
                continue;
            }
        };
        let message_id = extract_message_id(&payload, &uid);
        messages.push(RawMessage {
            uid,
            message_id,
            payload,
        });
    }
    Ok(messages)
}

/// Two-phase date-filtered scan: TOP the headers of each unseen message,
/// keep those dated at or after `since`, then RETR only the survivors.
/// A candidate whose headers cannot be fetched or dated is dropped.
fn scan_since<S: Pop3Io>(
    session: &mut S,
    seen: &HashSet<String>,
    since: DateTime<Utc>,
) -> Result<Vec<RawMessage>, MailError> {
    let listing = session.uidl()?;

    let mut survivors = Vec::new();
    for (seq, uid) in listing {
        if seen.contains(&uid) {
            continue;
        }
        let headers = match session.top(seq, 0) {
            Ok(headers) => headers,
            Err(e) => {
                tracing::debug!("TOP {} failed, dropping candidate: {}", seq, e);
                continue;
            }
        };
        match header_date(&headers) {
            Some(date) if date >= since => survivors.push((seq, uid)),
            _ => {}
        }
    }

    let mut messages = Vec::new();
    for (seq, uid) in survivors {
        let payload = match session.retr(seq) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Failed to retrieve message {}: {}", uid, e);
                continue;
            }
        };
        let message_id = extract_message_id(&payload, &uid);
        messages.push(RawMessage {
            uid,
            message_id,
            payload,
        });
    }
    Ok(messages)
}

/// Find one message by UID. `Ok(None)` means the server no longer lists it.
fn fetch_one<S: Pop3Io>(session: &mut S, uid: &str) -> Result<Option<RawMessage>, MailError> {
    let listing = session.uidl()?;
    let Some((seq, _)) = listing.into_iter().find(|(_, u)| u == uid) else {
        return Ok(None);
    };
    let payload = session.retr(seq)?;
    let message_id = extract_message_id(&payload, uid);
    Ok(Some(RawMessage {
        uid: uid.to_string(),
        message_id,
        payload,
    }))
}

/// Run `work` against the session and always QUIT afterwards, even when
/// the work failed. A failed QUIT never masks the work's own result.
fn run_session<S: Pop3Io, T>(
    session: &mut S,
    work: impl FnOnce(&mut S) -> Result<T, MailError>,
) -> Result<T, MailError> {
    let result = work(session);
    if let Err(e) = session.quit() {
        tracing::debug!("POP3 QUIT failed: {}", e);
    }
    result
}

/// Connect with `config` and run `work` inside a quit-guarded session.
fn with_session<T>(
    config: &Pop3Config,
    work: impl FnOnce(&mut Pop3Session) -> Result<T, MailError>,
) -> Result<T, MailError> {
    let mut session = Pop3Session::connect(config)?;
    run_session(&mut session, work)
}

/// Retry `call` up to [`MAX_ATTEMPTS`] times with exponential backoff,
/// returning the last error once attempts are exhausted.
async fn with_retry<T, F, Fut>(operation: &str, mut call: F) -> Result<T, MailError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MailError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < MAX_ATTEMPTS => {
                let delay_ms = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                tracing::warn!(
                    "{} attempt {} failed, retrying in {}ms: {}",
                    operation,
                    attempt,
                    delay_ms,
                    e
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// POP3-backed [`Mailbox`] that rereads settings on every operation, so
/// credential changes take effect without a restart.
pub struct Pop3Mailbox {
    settings: SettingsStore,
    records: RecordStore,
}

impl Pop3Mailbox {
    pub fn new(settings: SettingsStore, records: RecordStore) -> Self {
        Self { settings, records }
    }

    async fn config(&self) -> Result<Pop3Config, MailError> {
        let s = self.settings.pop3().await?;
        if !s.is_configured() {
            return Err(MailError::NotConfigured);
        }
        Ok(Pop3Config {
            host: s.host,
            port: s.port,
            username: s.username,
            password: SecretString::from(s.password),
            tls: s.tls,
        })
    }

    /// Connect and STAT, reporting what the server holds. Used by the
    /// settings test endpoint; does not retry.
    pub async fn test_connection(&self) -> Result<String, MailError> {
        let config = self.config().await?;
        let host = config.host.clone();
        let (count, _size) =
            tokio::task::spawn_blocking(move || with_session(&config, |session| session.stat()))
                .await
                .map_err(|e| MailError::Task(e.to_string()))??;
        Ok(format!("Connected to {host}: {count} message(s) on server"))
    }

    async fn seen_uids(&self) -> Result<Arc<HashSet<String>>, MailError> {
        Ok(Arc::new(self.records.processed_uid_set().await?))
    }
}

#[async_trait]
impl Mailbox for Pop3Mailbox {
    async fn fetch_unseen(&self) -> Result<Vec<RawMessage>, MailError> {
        let config = self.config().await?;
        let seen = self.seen_uids().await?;
        let messages = with_retry("fetch_unseen", || {
            let config = config.clone();
            let seen = Arc::clone(&seen);
            async move {
                tokio::task::spawn_blocking(move || {
                    with_session(&config, |session| scan_unseen(session, &seen))
                })
                .await
                .map_err(|e| MailError::Task(e.to_string()))?
            }
        })
        .await?;
        tracing::info!("Fetched {} unseen message(s)", messages.len());
        Ok(messages)
    }

    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<RawMessage>, MailError> {
        let config = self.config().await?;
        let seen = self.seen_uids().await?;
        let messages = with_retry("fetch_since", || {
            let config = config.clone();
            let seen = Arc::clone(&seen);
            async move {
                tokio::task::spawn_blocking(move || {
                    with_session(&config, |session| scan_since(session, &seen, since))
                })
                .await
                .map_err(|e| MailError::Task(e.to_string()))?
            }
        })
        .await?;
        tracing::info!(
            "Fetched {} message(s) dated at or after {}",
            messages.len(),
            since
        );
        Ok(messages)
    }

    async fn fetch_by_uid(&self, uid: &str) -> Result<Option<RawMessage>, MailError> {
        let config = self.config().await?;
        let uid = uid.to_string();
        with_retry("fetch_by_uid", || {
            let config = config.clone();
            let uid = uid.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    with_session(&config, |session| fetch_one(session, &uid))
                })
                .await
                .map_err(|e| MailError::Task(e.to_string()))?
            }
        })
        .await
    }
}
