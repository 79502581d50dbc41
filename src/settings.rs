//! Runtime settings persisted in the database.
//!
//! Settings live as JSON sections in the `settings` table (`pop3`, `ai`,
//! `notion`, `scheduler`) so the dashboard can change them without a
//! restart. Consumers read their section fresh at the point of use — the
//! mailbox adapter, analyzer, and sink never cache a stale copy.
//!
//! Sensitive fields (POP3 password, API keys) are masked when a section is
//! read for the API; a write carrying the mask placeholder keeps the stored
//! secret, so the dashboard can round-trip settings without ever seeing it.

use libsql::params;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::store::Db;

/// Placeholder returned instead of a stored secret, and recognized on write.
pub const MASKED: &str = "********";

fn mask(value: &str) -> String {
    if value.is_empty() {
        String::new()
    } else {
        MASKED.to_string()
    }
}

/// Keep the stored secret when the incoming value is the mask placeholder.
fn restore(incoming: &mut String, stored: &str) {
    if incoming == MASKED {
        *incoming = stored.to_string();
    }
}

// ── Sections ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Pop3Settings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: bool,
}

impl Default for Pop3Settings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 995,
            username: String::new(),
            password: String::new(),
            tls: true,
        }
    }
}

impl Pop3Settings {
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty() && !self.username.trim().is_empty()
    }

    pub fn masked(&self) -> Self {
        Self {
            password: mask(&self.password),
            ..self.clone()
        }
    }

    pub fn restore_masked(&mut self, stored: &Self) {
        restore(&mut self.password, &stored.password);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    /// Active provider: `claude` or `ollama`.
    pub provider: String,
    pub claude_api_key: String,
    pub claude_model: String,
    pub ollama_host: String,
    pub ollama_model: String,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            provider: "claude".to_string(),
            claude_api_key: String::new(),
            claude_model: "claude-haiku-4-5-20251001".to_string(),
            ollama_host: "http://localhost:11434".to_string(),
            ollama_model: "gemma3:12b".to_string(),
        }
    }
}

impl AiSettings {
    pub fn masked(&self) -> Self {
        Self {
            claude_api_key: mask(&self.claude_api_key),
            ..self.clone()
        }
    }

    pub fn restore_masked(&mut self, stored: &Self) {
        restore(&mut self.claude_api_key, &stored.claude_api_key);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotionSettings {
    pub api_key: String,
    pub database_id: String,
}

impl NotionSettings {
    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty() && !self.database_id.trim().is_empty()
    }

    pub fn masked(&self) -> Self {
        Self {
            api_key: mask(&self.api_key),
            database_id: self.database_id.clone(),
        }
    }

    pub fn restore_masked(&mut self, stored: &Self) {
        restore(&mut self.api_key, &stored.api_key);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub interval_minutes: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 5,
        }
    }
}

// ── Store ───────────────────────────────────────────────────────────

const SECTION_POP3: &str = "pop3";
const SECTION_AI: &str = "ai";
const SECTION_NOTION: &str = "notion";
const SECTION_SCHEDULER: &str = "scheduler";

/// DB-backed settings store, one JSON blob per section.
#[derive(Clone)]
pub struct SettingsStore {
    db: Db,
}

impl SettingsStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Write defaults for any section that has no row yet (first boot).
    pub async fn seed_defaults(&self) -> Result<(), DatabaseError> {
        self.seed_section(SECTION_POP3, &Pop3Settings::default())
            .await?;
        self.seed_section(SECTION_AI, &AiSettings::default()).await?;
        self.seed_section(SECTION_NOTION, &NotionSettings::default())
            .await?;
        self.seed_section(SECTION_SCHEDULER, &SchedulerSettings::default())
            .await?;
        Ok(())
    }

    pub async fn pop3(&self) -> Result<Pop3Settings, DatabaseError> {
        self.get_section(SECTION_POP3).await
    }

    pub async fn set_pop3(&self, value: &Pop3Settings) -> Result<(), DatabaseError> {
        self.put_section(SECTION_POP3, value).await
    }

    pub async fn ai(&self) -> Result<AiSettings, DatabaseError> {
        self.get_section(SECTION_AI).await
    }

    pub async fn set_ai(&self, value: &AiSettings) -> Result<(), DatabaseError> {
        self.put_section(SECTION_AI, value).await
    }

    pub async fn notion(&self) -> Result<NotionSettings, DatabaseError> {
        self.get_section(SECTION_NOTION).await
    }

    pub async fn set_notion(&self, value: &NotionSettings) -> Result<(), DatabaseError> {
        self.put_section(SECTION_NOTION, value).await
    }

    pub async fn scheduler(&self) -> Result<SchedulerSettings, DatabaseError> {
        self.get_section(SECTION_SCHEDULER).await
    }

    pub async fn set_scheduler(&self, value: &SchedulerSettings) -> Result<(), DatabaseError> {
        self.put_section(SECTION_SCHEDULER, value).await
    }

    async fn get_section<T>(&self, key: &str) -> Result<T, DatabaseError>
    where
        T: Default + DeserializeOwned,
    {
        let mut rows = self
            .db
            .conn()
            .query("SELECT value FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get settings {key}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("settings {key} value: {e}")))?;
                match serde_json::from_str(&raw) {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        // A corrupt section must not take the service down
                        warn!(section = key, error = %e, "Unreadable settings section, using defaults");
                        Ok(T::default())
                    }
                }
            }
            Ok(None) => Ok(T::default()),
            Err(e) => Err(DatabaseError::Query(format!("get settings {key}: {e}"))),
        }
    }

    async fn put_section<T: Serialize>(&self, key: &str, value: &T) -> Result<(), DatabaseError> {
        let raw = serde_json::to_string(value)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = chrono::Utc::now().to_rfc3339();

        self.db
            .conn()
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, raw, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put settings {key}: {e}")))?;

        debug!(section = key, "Settings updated");
        Ok(())
    }

    async fn seed_section<T: Serialize>(&self, key: &str, value: &T) -> Result<(), DatabaseError> {
        let raw = serde_json::to_string(value)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = chrono::Utc::now().to_rfc3339();

        self.db
            .conn()
            .execute(
                "INSERT OR IGNORE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, raw, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("seed settings {key}: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SettingsStore {
        let db = Db::open_memory().await.unwrap();
        SettingsStore::new(db)
    }

    #[tokio::test]
    async fn missing_sections_fall_back_to_defaults() {
        let store = test_store().await;

        let pop3 = store.pop3().await.unwrap();
        assert_eq!(pop3.port, 995);
        assert!(pop3.tls);
        assert!(!pop3.is_configured());

        let ai = store.ai().await.unwrap();
        assert_eq!(ai.provider, "claude");
        assert_eq!(ai.ollama_host, "http://localhost:11434");
    }

    #[tokio::test]
    async fn sections_roundtrip() {
        let store = test_store().await;

        let pop3 = Pop3Settings {
            host: "pop.example.com".into(),
            port: 995,
            username: "intake@example.com".into(),
            password: "hunter2".into(),
            tls: true,
        };
        store.set_pop3(&pop3).await.unwrap();

        let loaded = store.pop3().await.unwrap();
        assert_eq!(loaded.host, "pop.example.com");
        assert_eq!(loaded.password, "hunter2");
        assert!(loaded.is_configured());
    }

    #[tokio::test]
    async fn seed_defaults_does_not_clobber_existing() {
        let store = test_store().await;
        store
            .set_scheduler(&SchedulerSettings {
                enabled: true,
                interval_minutes: 15,
            })
            .await
            .unwrap();

        store.seed_defaults().await.unwrap();

        let sched = store.scheduler().await.unwrap();
        assert!(sched.enabled);
        assert_eq!(sched.interval_minutes, 15);
    }

    #[test]
    fn masking_hides_secrets_and_restore_keeps_them() {
        let stored = Pop3Settings {
            host: "pop.example.com".into(),
            password: "hunter2".into(),
            ..Default::default()
        };

        let masked = stored.masked();
        assert_eq!(masked.password, MASKED);
        assert_eq!(masked.host, "pop.example.com");

        // Dashboard sends the masked value back unchanged
        let mut incoming = masked;
        incoming.restore_masked(&stored);
        assert_eq!(incoming.password, "hunter2");

        // A new value replaces the secret
        let mut changed = stored.masked();
        changed.password = "new-secret".into();
        changed.restore_masked(&stored);
        assert_eq!(changed.password, "new-secret");
    }

    #[test]
    fn empty_secret_masks_to_empty() {
        let notion = NotionSettings::default();
        assert_eq!(notion.masked().api_key, "");
    }
}
