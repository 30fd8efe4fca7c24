//! Durable ledger for replay-archiver
//!
//! Handles SQLite persistence of archival outcomes. The `replays` table is
//! append-only: every resolved fetch attempt (success or tombstone) adds a row,
//! rows are never updated, and the newest row for a replay ID wins.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`records`] - Appending and querying ledger records
//! - [`state`] - Runtime state (shutdown tracking)

use crate::types::{LocalId, Record, ReplayId};
use sqlx::{FromRow, sqlite::SqlitePool};

mod migrations;
mod records;
mod state;

/// Ledger record from database (raw from SQLite)
#[derive(Debug, Clone, FromRow)]
pub struct RecordRow {
    /// Local surrogate key
    pub id: i64,
    /// Remote replay ID
    pub replay_id: ReplayId,
    /// Hex SHA-256 of the archived bytes, NULL for tombstones
    pub sha256: Option<String>,
    /// Size of the archived bytes, NULL for tombstones
    pub size_bytes: Option<i64>,
    /// Unix timestamp of the fetch attempt
    pub fetched_at: i64,
}

impl From<RecordRow> for Record {
    fn from(row: RecordRow) -> Self {
        use chrono::{TimeZone, Utc};

        Record {
            local_id: LocalId(row.id),
            id: row.replay_id,
            sha256: row.sha256,
            size_bytes: row.size_bytes.map(|s| s as u64),
            fetched_at: Utc
                .timestamp_opt(row.fetched_at, 0)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

/// Handle to the archival ledger
///
/// Owned by the coordinator behind an `Arc`; the underlying pool is released by
/// [`Database::close`] or when the last handle is dropped.
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
