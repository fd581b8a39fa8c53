//! SQL for the tracking and target tables.
//!
//! Statements are rendered once per pool, in the placeholder and upsert
//! syntax of its backend. Timestamps are stored as RFC 3339 text so the same
//! schema works on every backend.

use crate::config::validate_identifier;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, SyncRecord, SyncStatus};
use chrono::{DateTime, SecondsFormat, Utc};

const TRACKING_COLUMNS: &[&str] = &[
    "record_id",
    "source_table",
    "content_hash",
    "status",
    "last_synced_at",
    "source_updated_at",
];

const TARGET_COLUMNS: &[&str] = &["record_id", "source_table", "payload", "updated_at"];

/// Rendered statements for one backend.
#[derive(Debug, Clone)]
pub struct SyncStatements {
    pub tracking_table: String,
    pub target_table: String,
    pub create_tracking: String,
    pub create_target: String,
    /// `content_hash, status, source_updated_at` of one record
    pub select_state: String,
    /// Every tracking column of one record
    pub select_record: String,
    pub upsert_tracking: String,
    pub upsert_target: String,
}

impl SyncStatements {
    pub fn new(db_type: DatabaseType, tracking_table: &str, target_table: &str) -> DbResult<Self> {
        for table in [tracking_table, target_table] {
            validate_identifier(table)
                .map_err(|e| DbError::configuration(format!("invalid sync table name: {e}")))?;
        }
        if tracking_table == target_table {
            return Err(DbError::configuration(
                "sync tracking and target tables must differ",
            ));
        }

        let p1 = db_type.placeholder(1);
        Ok(Self {
            tracking_table: tracking_table.to_string(),
            target_table: target_table.to_string(),
            create_tracking: format!(
                "CREATE TABLE IF NOT EXISTS {tracking_table} (\
                 record_id VARCHAR(255) PRIMARY KEY, \
                 source_table VARCHAR(255) NOT NULL, \
                 content_hash VARCHAR(80) NOT NULL, \
                 status VARCHAR(16) NOT NULL, \
                 last_synced_at VARCHAR(40) NOT NULL, \
                 source_updated_at VARCHAR(40))"
            ),
            create_target: format!(
                "CREATE TABLE IF NOT EXISTS {target_table} (\
                 record_id VARCHAR(255) PRIMARY KEY, \
                 source_table VARCHAR(255) NOT NULL, \
                 payload TEXT NOT NULL, \
                 updated_at VARCHAR(40))"
            ),
            select_state: format!(
                "SELECT content_hash, status, source_updated_at FROM {tracking_table} WHERE record_id = {p1}"
            ),
            select_record: format!(
                "SELECT {} FROM {tracking_table} WHERE record_id = {p1}",
                TRACKING_COLUMNS.join(", ")
            ),
            upsert_tracking: upsert(db_type, tracking_table, TRACKING_COLUMNS),
            upsert_target: upsert(db_type, target_table, TARGET_COLUMNS),
        })
    }
}

fn upsert(db_type: DatabaseType, table: &str, columns: &[&str]) -> String {
    format!(
        "INSERT INTO {table} ({}) VALUES ({}) {}",
        columns.join(", "),
        db_type.placeholders(columns.len()),
        db_type.upsert_suffix(columns[0], &columns[1..])
    )
}

/// Keeps every non-zero sub-second digit, so a stored time parses back unchanged.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Lenient parse; unreadable stored timestamps count as absent.
pub fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|at| at.with_timezone(&Utc))
}

/// Tracking state needed to decide what to do with an incoming record.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedState {
    pub content_hash: String,
    pub status: SyncStatus,
    pub source_updated_at: Option<DateTime<Utc>>,
}

impl TrackedState {
    pub fn from_columns(
        content_hash: String,
        status: &str,
        source_updated_at: Option<String>,
    ) -> DbResult<Self> {
        Ok(Self {
            content_hash,
            status: parse_status(status)?,
            source_updated_at: parse_timestamp(source_updated_at.as_deref()),
        })
    }
}

pub fn parse_status(status: &str) -> DbResult<SyncStatus> {
    SyncStatus::parse(status)
        .ok_or_else(|| DbError::internal(format!("unknown sync status '{status}' in tracking table")))
}

/// Build a [`SyncRecord`] from the columns of `select_record`.
pub fn record_from_columns(
    record_id: String,
    source_table: String,
    content_hash: String,
    status: &str,
    last_synced_at: &str,
    source_updated_at: Option<String>,
) -> DbResult<SyncRecord> {
    let last_synced_at = parse_timestamp(Some(last_synced_at)).ok_or_else(|| {
        DbError::internal(format!(
            "invalid last_synced_at '{last_synced_at}' for record '{record_id}'"
        ))
    })?;
    Ok(SyncRecord {
        status: parse_status(status)?,
        source_updated_at: parse_timestamp(source_updated_at.as_deref()),
        record_id,
        source_table,
        content_hash,
        last_synced_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_statements() {
        let sql = SyncStatements::new(DatabaseType::PostgreSQL, "sync_tracking", "sync_documents").unwrap();
        assert_eq!(
            sql.select_state,
            "SELECT content_hash, status, source_updated_at FROM sync_tracking WHERE record_id = $1"
        );
        assert_eq!(
            sql.upsert_target,
            "INSERT INTO sync_documents (record_id, source_table, payload, updated_at) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (record_id) DO UPDATE SET \
             source_table = excluded.source_table, payload = excluded.payload, \
             updated_at = excluded.updated_at"
        );
    }

    #[test]
    fn test_mysql_upsert() {
        let sql = SyncStatements::new(DatabaseType::MySQL, "t", "d").unwrap();
        assert!(sql.upsert_tracking.contains("VALUES (?, ?, ?, ?, ?, ?) ON DUPLICATE KEY UPDATE"));
        assert!(sql.upsert_tracking.ends_with("source_updated_at = VALUES(source_updated_at)"));
    }

    #[test]
    fn test_table_names_validated() {
        assert!(SyncStatements::new(DatabaseType::SQLite, "bad name", "d").is_err());
        assert!(SyncStatements::new(DatabaseType::SQLite, "same", "same").is_err());
    }

    #[test]
    fn test_timestamps() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        let text = format_timestamp(at);
        assert_eq!(text, "2024-05-01T10:00:00.123456Z");
        assert_eq!(parse_timestamp(Some(&text)), Some(at));
        assert_eq!(parse_timestamp(Some("yesterday")), None);
        assert_eq!(parse_timestamp(None), None);
    }

    #[test]
    fn test_timestamps_keep_nanoseconds() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let text = format_timestamp(at);
        assert_eq!(text, "2024-05-01T10:00:00.123456789Z");
        assert_eq!(parse_timestamp(Some(&text)), Some(at));

        let whole = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(format_timestamp(whole), "2024-05-01T10:00:00Z");
    }
}
