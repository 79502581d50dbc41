//! Persistence layer — libSQL database handle and stores.
//!
//! All state lives in a single SQLite file (or an in-memory database in
//! tests): the processed-message audit log, the category vocabulary, and
//! the runtime settings sections.

mod categories;
mod migrations;
mod records;

pub use categories::{Category, CategoryStore, CategoryUpdate, NewCategory};
pub use records::{
    NewRecord, PipelineStats, ProcessedRecord, RecordFilters, RecordPage, RecordStatus,
    RecordStore, RecordUpdate,
};

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase};
use tracing::info;

use crate::error::DatabaseError;

/// Shared database handle.
///
/// Holds the libSQL database plus a single connection reused for all
/// operations. `libsql::Connection` is `Send + Sync` and safe for
/// concurrent async use; cloning the handle is cheap.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

struct DbInner {
    #[allow(dead_code)]
    db: LibSqlDatabase,
    conn: Connection,
}

impl Db {
    /// Open (or create) a local database file and run migrations.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Open(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Open(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Database opened");

        Ok(Self {
            inner: Arc::new(DbInner { db, conn }),
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn open_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Open(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            inner: Arc::new(DbInner { db, conn }),
        })
    }

    /// Get the connection.
    pub(crate) fn conn(&self) -> &Connection {
        &self.inner.conn
    }
}

// ── Shared row helpers ──────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Try SQLite datetime() output with fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    // Try SQLite datetime() output without fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<String>` to a libsql Value.
pub(crate) fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<i64>` to a libsql Value.
pub(crate) fn opt_integer(n: Option<i64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}
