//! Appending and querying ledger records.

use crate::error::DatabaseError;
use crate::types::{LedgerStats, LocalId, Record, ReplayId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;

use super::{Database, RecordRow};

const RECORD_COLUMNS: &str = "id, replay_id, sha256, size_bytes, fetched_at";

/// Latest unix timestamp a tombstone may carry and still be eligible for retry
fn cooldown_threshold(now: DateTime<Utc>, cooldown: Duration) -> i64 {
    let cooldown_secs = i64::try_from(cooldown.as_secs()).unwrap_or(i64::MAX);
    now.timestamp().saturating_sub(cooldown_secs)
}

impl Database {
    /// Append a success record for `id`
    ///
    /// The insert is committed (and, with `synchronous=FULL`, on disk) before the
    /// new local ID is returned.
    pub async fn record_success(
        &self,
        id: ReplayId,
        sha256: &str,
        size_bytes: u64,
        at: DateTime<Utc>,
    ) -> Result<LocalId> {
        let size = i64::try_from(size_bytes).map_err(|_| {
            Error::Database(DatabaseError::ConstraintViolation(format!(
                "size {} of replay {} does not fit the ledger",
                size_bytes, id
            )))
        })?;

        let result = sqlx::query(
            r#"
            INSERT INTO replays (replay_id, sha256, size_bytes, fetched_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(sha256)
        .bind(size)
        .bind(at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record success for replay {}: {}",
                id, e
            )))
        })?;

        Ok(LocalId(result.last_insert_rowid()))
    }

    /// Append a tombstone record for `id` (confirmed absent at the remote)
    pub async fn record_absent(&self, id: ReplayId, at: DateTime<Utc>) -> Result<LocalId> {
        let result = sqlx::query(
            r#"
            INSERT INTO replays (replay_id, sha256, size_bytes, fetched_at)
            VALUES (?, NULL, NULL, ?)
            "#,
        )
        .bind(id)
        .bind(at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record tombstone for replay {}: {}",
                id, e
            )))
        })?;

        Ok(LocalId(result.last_insert_rowid()))
    }

    /// Every replay ID with at least one terminal record
    pub async fn resolved_ids(&self) -> Result<HashSet<ReplayId>> {
        let ids: Vec<ReplayId> = sqlx::query_scalar("SELECT DISTINCT replay_id FROM replays")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to list resolved replay IDs: {}",
                    e
                )))
            })?;

        Ok(ids.into_iter().collect())
    }

    /// Replay IDs within `start..=end` with at least one terminal record
    pub async fn resolved_ids_in(
        &self,
        start: ReplayId,
        end: ReplayId,
    ) -> Result<HashSet<ReplayId>> {
        let ids: Vec<ReplayId> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT replay_id FROM replays
            WHERE replay_id BETWEEN ? AND ?
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list resolved replay IDs in {}..={}: {}",
                start, end, e
            )))
        })?;

        Ok(ids.into_iter().collect())
    }

    /// Number of distinct replay IDs in `[start, end]` with any record
    pub async fn count_resolved_in(&self, start: ReplayId, end: ReplayId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(DISTINCT replay_id) FROM replays
            WHERE replay_id BETWEEN ? AND ?
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to count resolved replay IDs in {}..={}: {}",
                start, end, e
            )))
        })?;

        Ok(count as u64)
    }

    /// Whether `id` is tombstoned, has never succeeded, and its latest tombstone is
    /// at least `cooldown` old at `now`
    pub async fn is_absent_eligible_for_retry(
        &self,
        id: ReplayId,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> Result<bool> {
        let threshold = cooldown_threshold(now, cooldown);

        let eligible: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT r.fetched_at FROM replays r
            WHERE r.replay_id = ?
              AND r.id = (SELECT MAX(id) FROM replays WHERE replay_id = ?)
              AND r.sha256 IS NULL
              AND r.fetched_at <= ?
              AND NOT EXISTS (
                  SELECT 1 FROM replays s WHERE s.replay_id = ? AND s.sha256 IS NOT NULL
              )
            "#,
        )
        .bind(id)
        .bind(id)
        .bind(threshold)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to check tombstone retry eligibility for replay {}: {}",
                id, e
            )))
        })?;

        Ok(eligible.is_some())
    }

    /// Tombstoned IDs within `start..=end` whose cooldown has expired at `now`
    ///
    /// Bulk form of [`Database::is_absent_eligible_for_retry`], ascending by ID.
    pub async fn tombstones_eligible_for_retry(
        &self,
        start: ReplayId,
        end: ReplayId,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> Result<Vec<ReplayId>> {
        let threshold = cooldown_threshold(now, cooldown);

        let ids: Vec<ReplayId> = sqlx::query_scalar(
            r#"
            SELECT r.replay_id FROM replays r
            WHERE r.replay_id BETWEEN ? AND ?
              AND r.id = (SELECT MAX(id) FROM replays WHERE replay_id = r.replay_id)
              AND r.sha256 IS NULL
              AND r.fetched_at <= ?
              AND NOT EXISTS (
                  SELECT 1 FROM replays s
                  WHERE s.replay_id = r.replay_id AND s.sha256 IS NOT NULL
              )
            ORDER BY r.replay_id ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(threshold)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list retryable tombstones: {}",
                e
            )))
        })?;

        Ok(ids)
    }

    /// Most recent record for `id`
    pub async fn latest_record(&self, id: ReplayId) -> Result<Option<Record>> {
        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM replays WHERE replay_id = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get latest record for replay {}: {}",
                id, e
            )))
        })?;

        Ok(row.map(Record::from))
    }

    /// Most recent success record for `id`
    pub async fn latest_success(&self, id: ReplayId) -> Result<Option<Record>> {
        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM replays \
             WHERE replay_id = ? AND sha256 IS NOT NULL ORDER BY id DESC LIMIT 1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get latest success for replay {}: {}",
                id, e
            )))
        })?;

        Ok(row.map(Record::from))
    }

    /// Full history of `id`, oldest first
    pub async fn records_for(&self, id: ReplayId) -> Result<Vec<Record>> {
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM replays WHERE replay_id = ? ORDER BY id ASC"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list records for replay {}: {}",
                id, e
            )))
        })?;

        Ok(rows.into_iter().map(Record::from).collect())
    }

    /// Success records whose content hash is `sha256`, oldest first
    ///
    /// More than one replay ID can map to the same blob when identical replays
    /// were published under different IDs.
    pub async fn find_by_hash(&self, sha256: &str) -> Result<Vec<Record>> {
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM replays WHERE sha256 = ? ORDER BY id ASC"
        ))
        .bind(sha256)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to find records by hash: {}",
                e
            )))
        })?;

        Ok(rows.into_iter().map(Record::from).collect())
    }

    /// Every ledger record in creation order
    pub async fn all_records(&self) -> Result<Vec<Record>> {
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM replays ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list records: {}",
                e
            )))
        })?;

        Ok(rows.into_iter().map(Record::from).collect())
    }

    /// Total number of ledger rows
    pub async fn count_records(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM replays")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count records: {}",
                    e
                )))
            })?;

        Ok(count as u64)
    }

    /// Highest replay ID with any record
    pub async fn max_replay_id(&self) -> Result<Option<ReplayId>> {
        let max: Option<ReplayId> = sqlx::query_scalar("SELECT MAX(replay_id) FROM replays")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to query highest replay ID: {}",
                    e
                )))
            })?;

        Ok(max)
    }

    /// Highest replay ID that was ever archived successfully
    ///
    /// Tombstones do not count: an ID beyond the live tail is recorded as absent
    /// and must not push the known end of the ID space outward.
    pub async fn max_archived_id(&self) -> Result<Option<ReplayId>> {
        let max: Option<ReplayId> =
            sqlx::query_scalar("SELECT MAX(replay_id) FROM replays WHERE sha256 IS NOT NULL")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to query highest archived replay ID: {}",
                        e
                    )))
                })?;

        Ok(max)
    }

    /// Aggregate statistics over the whole ledger
    pub async fn ledger_stats(&self) -> Result<LedgerStats> {
        let (archived_ids, tombstoned_ids, total_records, archived_bytes): (i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    (SELECT COUNT(DISTINCT replay_id) FROM replays WHERE sha256 IS NOT NULL),
                    (SELECT COUNT(DISTINCT r.replay_id) FROM replays r
                        WHERE NOT EXISTS (
                            SELECT 1 FROM replays s
                            WHERE s.replay_id = r.replay_id AND s.sha256 IS NOT NULL
                        )),
                    (SELECT COUNT(*) FROM replays),
                    (SELECT COALESCE(SUM(size_bytes), 0) FROM replays
                        WHERE id IN (
                            SELECT MAX(id) FROM replays
                            WHERE sha256 IS NOT NULL GROUP BY replay_id
                        ))
                "#,
            )
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to compute ledger statistics: {}",
                    e
                )))
            })?;

        let max_replay_id = self.max_replay_id().await?;

        Ok(LedgerStats {
            archived_ids: archived_ids as u64,
            tombstoned_ids: tombstoned_ids as u64,
            total_records: total_records as u64,
            archived_bytes: archived_bytes as u64,
            max_replay_id: max_replay_id.map(|id| id.0),
        })
    }
}
