//! SQLite-backed sync state for the device client
//!
//! This module holds the operational data the client needs between runs:
//! - sync_status: per (user, source, metric) cursor and last outcome

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Result, VitalsError};
use crate::models::{MetricType, SyncStatus};

/// SQLite database for client sync state
pub struct SyncDb {
    conn: Connection,
}

impl SyncDb {
    /// Open or create the sync database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| VitalsError::database("Failed to open sync database", e))?;

        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| VitalsError::database("Failed to open in-memory database", e))?;

        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Run migrations
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS sync_status (
                    user_id TEXT NOT NULL,
                    source TEXT NOT NULL,
                    metric_type TEXT NOT NULL,
                    last_sync_date TEXT,
                    success INTEGER NOT NULL DEFAULT 0,
                    error_message TEXT,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (user_id, source, metric_type)
                );
                "#,
            )
            .map_err(|e| VitalsError::database("Failed to run migrations", e))?;

        Ok(())
    }

    /// Get the status row for a user, source and metric
    pub fn get_status(
        &self,
        user_id: &str,
        source: &str,
        metric_type: MetricType,
    ) -> Result<Option<SyncStatus>> {
        self.conn
            .query_row(
                "SELECT user_id, source, metric_type, last_sync_date, success, error_message, updated_at
                 FROM sync_status
                 WHERE user_id = ? AND source = ? AND metric_type = ?",
                params![user_id, source, metric_type.as_str()],
                row_to_status,
            )
            .optional()
            .map_err(|e| VitalsError::database("Failed to get sync status", e))
    }

    /// Insert or update a status row.
    ///
    /// The stored cursor never moves backwards, even if the caller passes an
    /// older `last_sync_date`.
    pub fn upsert_status(&self, status: &SyncStatus) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_status
                     (user_id, source, metric_type, last_sync_date, success, error_message, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (user_id, source, metric_type) DO UPDATE SET
                     last_sync_date = CASE
                         WHEN sync_status.last_sync_date IS NULL THEN excluded.last_sync_date
                         WHEN excluded.last_sync_date IS NULL THEN sync_status.last_sync_date
                         WHEN excluded.last_sync_date > sync_status.last_sync_date THEN excluded.last_sync_date
                         ELSE sync_status.last_sync_date
                     END,
                     success = excluded.success,
                     error_message = excluded.error_message,
                     updated_at = excluded.updated_at",
                params![
                    status.user_id,
                    status.source,
                    status.metric_type.as_str(),
                    status.last_sync_date.map(format_ts),
                    status.success,
                    status.error_message,
                    format_ts(status.updated_at),
                ],
            )
            .map_err(|e| VitalsError::database("Failed to update sync status", e))?;

        Ok(())
    }

    /// All status rows for a user, ordered by source then metric
    pub fn list_statuses(&self, user_id: &str) -> Result<Vec<SyncStatus>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT user_id, source, metric_type, last_sync_date, success, error_message, updated_at
                 FROM sync_status
                 WHERE user_id = ?
                 ORDER BY source, metric_type",
            )
            .map_err(|e| VitalsError::database("Failed to prepare query", e))?;

        let rows = stmt
            .query_map(params![user_id], row_to_status)
            .map_err(|e| VitalsError::database("Failed to query sync status", e))?;

        let mut statuses = Vec::new();
        for row in rows {
            statuses.push(row?);
        }
        Ok(statuses)
    }

    /// Per-metric cursors for a user and source
    pub fn cursors(&self, user_id: &str, source: &str) -> Result<HashMap<MetricType, DateTime<Utc>>> {
        Ok(self
            .list_statuses(user_id)?
            .into_iter()
            .filter(|s| s.source == source)
            .filter_map(|s| s.last_sync_date.map(|ts| (s.metric_type, ts)))
            .collect())
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    // Fixed-width UTC form keeps lexical order equal to time order
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_to_status(row: &Row<'_>) -> rusqlite::Result<SyncStatus> {
    let metric: String = row.get(2)?;
    let metric_type = metric.parse::<MetricType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(SyncStatus {
        user_id: row.get(0)?,
        source: row.get(1)?,
        metric_type,
        last_sync_date: row.get::<_, Option<String>>(3)?.as_deref().and_then(parse_ts),
        success: row.get(4)?,
        error_message: row.get(5)?,
        updated_at: row
            .get::<_, String>(6)
            .ok()
            .as_deref()
            .and_then(parse_ts)
            .unwrap_or_else(Utc::now),
    })
}
