//! Processed-message audit store.
//!
//! Every message the pipeline touches ends up here exactly once per path-A
//! run: `success` when delivered (or classified as not-a-requirement),
//! `skipped` on a dedup hit, `error` on any per-item failure. Reprocessing
//! updates the existing row in place rather than appending a new one.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveTime, Utc};
use libsql::params;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DatabaseError;
use crate::store::{Db, opt_integer, opt_text_owned, parse_datetime};

/// Outcome of processing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Analyzed and (where applicable) delivered.
    Success,
    /// Dedup hit — already processed under the same message id.
    Skipped,
    /// Processing failed; the error message column says why.
    Error,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }

    /// Strict parse, used for query-filter validation.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "skipped" => Some(Self::Skipped),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Lenient parse for row mapping — unknown strings become `Error`.
fn str_to_status(s: &str) -> RecordStatus {
    RecordStatus::from_str(s).unwrap_or(RecordStatus::Error)
}

/// One audited processing outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedRecord {
    pub id: i64,
    pub mail_uid: String,
    pub message_id: String,
    pub from_address: String,
    pub subject: String,
    pub status: RecordStatus,
    pub category: Option<String>,
    pub priority: Option<String>,
    pub page_id: Option<String>,
    pub page_url: Option<String>,
    pub error_message: Option<String>,
    pub provider: Option<String>,
    pub processing_ms: Option<i64>,
    pub raw_classification: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for creating an audit row.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub mail_uid: String,
    pub message_id: String,
    pub from_address: String,
    pub subject: String,
    pub status: RecordStatus,
    pub category: Option<String>,
    pub priority: Option<String>,
    pub page_id: Option<String>,
    pub page_url: Option<String>,
    pub error_message: Option<String>,
    pub provider: Option<String>,
    pub processing_ms: Option<i64>,
    pub raw_classification: Option<String>,
}

impl NewRecord {
    /// A bare row with the given identity and status; optional columns unset.
    pub fn new(
        mail_uid: impl Into<String>,
        message_id: impl Into<String>,
        status: RecordStatus,
    ) -> Self {
        Self {
            mail_uid: mail_uid.into(),
            message_id: message_id.into(),
            from_address: String::new(),
            subject: String::new(),
            status,
            category: None,
            priority: None,
            page_id: None,
            page_url: None,
            error_message: None,
            provider: None,
            processing_ms: None,
            raw_classification: None,
        }
    }
}

/// In-place update applied by `update_status` (reprocessing).
///
/// Every mutable column is written; `error_message: None` clears the old
/// failure text when a retry succeeds.
#[derive(Debug, Clone)]
pub struct RecordUpdate {
    pub status: RecordStatus,
    pub from_address: String,
    pub subject: String,
    pub category: Option<String>,
    pub priority: Option<String>,
    pub page_id: Option<String>,
    pub page_url: Option<String>,
    pub error_message: Option<String>,
    pub provider: Option<String>,
    pub processing_ms: Option<i64>,
    pub raw_classification: Option<String>,
}

/// Query filters for the records listing.
#[derive(Debug, Clone)]
pub struct RecordFilters {
    pub status: Option<RecordStatus>,
    pub category: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    /// 1-based page number; 0 is treated as 1.
    pub page: u32,
    pub limit: u32,
}

impl Default for RecordFilters {
    fn default() -> Self {
        Self {
            status: None,
            category: None,
            date_from: None,
            date_to: None,
            page: 1,
            limit: 20,
        }
    }
}

/// One page of records plus the total match count.
#[derive(Debug, Serialize)]
pub struct RecordPage {
    pub records: Vec<ProcessedRecord>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

/// Aggregate numbers for the dashboard.
#[derive(Debug, Serialize)]
pub struct PipelineStats {
    pub total_count: i64,
    pub today_count: i64,
    /// Percentage of `success` rows, rounded to 2 decimal places. 0 when
    /// the store is empty.
    pub success_rate: f64,
    /// Success-row counts per category.
    pub category_distribution: BTreeMap<String, i64>,
}

const RECORD_COLUMNS: &str = "id, mail_uid, message_id, from_address, subject, status, category, \
     priority, page_id, page_url, error_message, provider, processing_ms, raw_classification, \
     created_at";

/// Map a libsql Row to a ProcessedRecord. Column order matches RECORD_COLUMNS.
fn row_to_record(row: &libsql::Row) -> Result<ProcessedRecord, libsql::Error> {
    let status_str: String = row.get(5)?;
    let created_str: String = row.get(14)?;

    Ok(ProcessedRecord {
        id: row.get(0)?,
        mail_uid: row.get(1)?,
        message_id: row.get(2)?,
        from_address: row.get(3)?,
        subject: row.get(4)?,
        status: str_to_status(&status_str),
        category: row.get(6).ok(),
        priority: row.get(7).ok(),
        page_id: row.get(8).ok(),
        page_url: row.get(9).ok(),
        error_message: row.get(10).ok(),
        provider: row.get(11).ok(),
        processing_ms: row.get(12).ok(),
        raw_classification: row.get(13).ok(),
        created_at: parse_datetime(&created_str),
    })
}

/// Audit store over the `processed_messages` table.
#[derive(Clone)]
pub struct RecordStore {
    db: Db,
}

impl RecordStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert a new audit row and return it with id and timestamp filled in.
    pub async fn create(&self, rec: NewRecord) -> Result<ProcessedRecord, DatabaseError> {
        let conn = self.db.conn();
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO processed_messages (mail_uid, message_id, from_address, subject, status, \
                 category, priority, page_id, page_url, error_message, provider, processing_ms, \
                 raw_classification, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                rec.mail_uid,
                rec.message_id.clone(),
                rec.from_address,
                rec.subject,
                rec.status.as_str(),
                opt_text_owned(rec.category),
                opt_text_owned(rec.priority),
                opt_text_owned(rec.page_id),
                opt_text_owned(rec.page_url),
                opt_text_owned(rec.error_message),
                opt_text_owned(rec.provider),
                opt_integer(rec.processing_ms),
                opt_text_owned(rec.raw_classification),
                now,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("create record: {e}")))?;

        let id = conn.last_insert_rowid();
        debug!(id, message_id = %rec.message_id, status = rec.status.as_str(), "Record created");

        self.find_by_id(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "processed_message".into(),
                id: id.to_string(),
            })
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<ProcessedRecord>, DatabaseError> {
        self.find_one(
            &format!("SELECT {RECORD_COLUMNS} FROM processed_messages WHERE id = ?1"),
            params![id],
            "find_by_id",
        )
        .await
    }

    pub async fn find_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<ProcessedRecord>, DatabaseError> {
        self.find_one(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM processed_messages WHERE message_id = ?1 \
                 ORDER BY created_at DESC LIMIT 1"
            ),
            params![message_id],
            "find_by_message_id",
        )
        .await
    }

    pub async fn find_by_uid(&self, uid: &str) -> Result<Option<ProcessedRecord>, DatabaseError> {
        self.find_one(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM processed_messages WHERE mail_uid = ?1 \
                 ORDER BY created_at DESC LIMIT 1"
            ),
            params![uid],
            "find_by_uid",
        )
        .await
    }

    async fn find_one(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Option<ProcessedRecord>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let rec = row_to_record(&row)
                    .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?;
                Ok(Some(rec))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }

    /// All UIDs ever recorded — the mailbox adapter's first-pass filter.
    pub async fn processed_uid_set(&self) -> Result<HashSet<String>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query("SELECT DISTINCT mail_uid FROM processed_messages", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("processed_uid_set: {e}")))?;

        let mut uids = HashSet::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(uid) = row.get::<String>(0) {
                uids.insert(uid);
            }
        }
        Ok(uids)
    }

    /// Rewrite the mutable columns of an existing row (reprocessing).
    pub async fn update_status(&self, id: i64, update: RecordUpdate) -> Result<(), DatabaseError> {
        let affected = self
            .db
            .conn()
            .execute(
                "UPDATE processed_messages SET status = ?1, from_address = ?2, subject = ?3, \
                     category = ?4, priority = ?5, page_id = ?6, page_url = ?7, \
                     error_message = ?8, provider = ?9, processing_ms = ?10, \
                     raw_classification = ?11 \
                 WHERE id = ?12",
                params![
                    update.status.as_str(),
                    update.from_address,
                    update.subject,
                    opt_text_owned(update.category),
                    opt_text_owned(update.priority),
                    opt_text_owned(update.page_id),
                    opt_text_owned(update.page_url),
                    opt_text_owned(update.error_message),
                    opt_text_owned(update.provider),
                    opt_integer(update.processing_ms),
                    opt_text_owned(update.raw_classification),
                    id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_status: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "processed_message".into(),
                id: id.to_string(),
            });
        }
        debug!(id, status = update.status.as_str(), "Record updated");
        Ok(())
    }

    /// Filtered, paginated listing, newest first.
    pub async fn find_all(&self, filters: &RecordFilters) -> Result<RecordPage, DatabaseError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();

        if let Some(status) = filters.status {
            values.push(libsql::Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(category) = &filters.category {
            values.push(libsql::Value::Text(category.clone()));
            clauses.push(format!("category = ?{}", values.len()));
        }
        if let Some(from) = filters.date_from {
            values.push(libsql::Value::Text(from.to_rfc3339()));
            clauses.push(format!("created_at >= ?{}", values.len()));
        }
        if let Some(to) = filters.date_to {
            values.push(libsql::Value::Text(to.to_rfc3339()));
            clauses.push(format!("created_at <= ?{}", values.len()));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let conn = self.db.conn();

        let mut rows = conn
            .query(
                &format!("SELECT COUNT(*) FROM processed_messages{where_sql}"),
                libsql::params_from_iter(values.clone()),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_all count: {e}")))?;
        let total: i64 = match rows.next().await {
            Ok(Some(row)) => row.get(0).unwrap_or(0),
            _ => 0,
        };

        let page = filters.page.max(1);
        let limit = filters.limit.clamp(1, 100);
        let offset = (page - 1) as i64 * limit as i64;

        values.push(libsql::Value::Integer(limit as i64));
        let limit_idx = values.len();
        values.push(libsql::Value::Integer(offset));
        let offset_idx = values.len();

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM processed_messages{where_sql} \
                     ORDER BY created_at DESC, id DESC LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
                ),
                libsql::params_from_iter(values),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_all: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_record(&row) {
                Ok(rec) => records.push(rec),
                Err(e) => tracing::warn!("Skipping record row: {e}"),
            }
        }

        Ok(RecordPage {
            records,
            total,
            page,
            limit,
        })
    }

    /// The most recent rows, newest first (dashboard).
    pub async fn recent(&self, limit: u32) -> Result<Vec<ProcessedRecord>, DatabaseError> {
        let page = self
            .find_all(&RecordFilters {
                limit,
                ..Default::default()
            })
            .await?;
        Ok(page.records)
    }

    /// Aggregate counts for the dashboard.
    pub async fn stats(&self) -> Result<PipelineStats, DatabaseError> {
        let conn = self.db.conn();

        let total_count = self.count_where("", ()).await?;

        let today_start = Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc();
        let today_count = self
            .count_where("WHERE created_at >= ?1", params![today_start.to_rfc3339()])
            .await?;

        let success_count = self
            .count_where("WHERE status = ?1", params![RecordStatus::Success.as_str()])
            .await?;

        // Percentage rounded to 2 decimal places
        let success_rate = if total_count > 0 {
            (success_count as f64 / total_count as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };

        let mut rows = conn
            .query(
                "SELECT category, COUNT(*) FROM processed_messages \
                 WHERE status = 'success' AND category IS NOT NULL \
                 GROUP BY category",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stats distribution: {e}")))?;

        let mut category_distribution = BTreeMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let category: String = row.get(0).unwrap_or_default();
            let count: i64 = row.get(1).unwrap_or(0);
            category_distribution.insert(category, count);
        }

        Ok(PipelineStats {
            total_count,
            today_count,
            success_rate,
            category_distribution,
        })
    }

    async fn count_where(
        &self,
        where_sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<i64, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                &format!("SELECT COUNT(*) FROM processed_messages {where_sql}"),
                params,
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get(0).unwrap_or(0)),
            _ => Ok(0),
        }
    }
}
