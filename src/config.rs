//! Process configuration read from the environment.
//!
//! This covers only what the process needs before the database is open
//! (bind address, database path, log destination). Everything tunable at
//! runtime lives in the settings store instead.

use std::path::PathBuf;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP listen port.
    pub http_port: u16,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Dashboard origin allowed through CORS.
    pub frontend_origin: String,
    /// Optional directory for daily-rolling log files. Logs go to stdout
    /// when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: PathBuf::from("data/mailclerk.db"),
            frontend_origin: "http://localhost:5173".to_string(),
            log_dir: None,
        }
    }
}

impl AppConfig {
    /// Build configuration from `MAILCLERK_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let http_port = std::env::var("MAILCLERK_HTTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.http_port);

        let db_path = std::env::var("MAILCLERK_DB_PATH")
            .ok()
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let frontend_origin = std::env::var("MAILCLERK_FRONTEND_ORIGIN")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.frontend_origin);

        let log_dir = std::env::var("MAILCLERK_LOG_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Self {
            http_port,
            db_path,
            frontend_origin,
            log_dir,
        }
    }
}
