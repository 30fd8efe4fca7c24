//! Core types for replay-archiver

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Remote source identifier of a replay (the integer in the download URL)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplayId(pub u64);

impl ReplayId {
    /// Create a new ReplayId
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ReplayId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ReplayId> for u64 {
    fn from(id: ReplayId) -> Self {
        id.0
    }
}

impl PartialEq<u64> for ReplayId {
    fn eq(&self, other: &u64) -> bool {
        self.0 == *other
    }
}

impl std::fmt::Display for ReplayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ReplayId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

// SQLite stores integers as i64; replay IDs above i64::MAX are rejected at bind time
impl sqlx::Type<sqlx::Sqlite> for ReplayId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for ReplayId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        let value = i64::try_from(self.0)?;
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&value, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for ReplayId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(u64::try_from(id)?))
    }
}

/// Local surrogate key of a ledger record (strictly increasing in creation order)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub i64);

impl std::fmt::Display for LocalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One durably-resolved fetch attempt
///
/// A record with `sha256 == None` is a tombstone: the remote confirmed the replay
/// does not exist at `fetched_at`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Local surrogate key
    pub local_id: LocalId,
    /// Remote source ID
    pub id: ReplayId,
    /// Lowercase hex SHA-256 of the archived bytes (None for tombstones)
    pub sha256: Option<String>,
    /// Size of the archived bytes (None for tombstones)
    pub size_bytes: Option<u64>,
    /// When the attempt that produced this record ran
    pub fetched_at: DateTime<Utc>,
}

impl Record {
    /// Whether this record marks the replay as confirmed absent
    pub fn is_tombstone(&self) -> bool {
        self.sha256.is_none()
    }
}

/// Classified result of exactly one fetch attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The replay was retrieved in full
    Success {
        /// Raw replay bytes
        bytes: Vec<u8>,
    },
    /// The remote affirmatively reported that the replay does not exist
    Absent {
        /// HTTP status that signalled absence
        status: u16,
    },
    /// Network failure, timeout, server error or rate limiting; retry later
    Transient {
        /// Human-readable cause, kept for the abandoned-ID report
        reason: String,
    },
}

impl FetchOutcome {
    /// Shorthand for a transient outcome
    pub fn transient(reason: impl Into<String>) -> Self {
        FetchOutcome::Transient {
            reason: reason.into(),
        }
    }
}

/// Per-ID state within a single run
///
/// ```text
/// Pending -> InFlight -> { Succeeded, Tombstoned, Retryable, StorageFailed, Interrupted }
/// Retryable -> { Pending, Abandoned }
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdState {
    /// Waiting in the queue (possibly until a backoff deadline)
    Pending,
    /// A worker is processing this ID
    InFlight,
    /// Bytes stored and success recorded in the ledger
    Succeeded,
    /// Confirmed absent and tombstone recorded in the ledger
    Tombstoned,
    /// Last attempt failed transiently; backoff pending
    Retryable,
    /// Gave up after the configured number of attempts
    Abandoned,
    /// Local storage failed; nothing recorded for this run
    StorageFailed,
    /// Shutdown cancelled the attempt before anything was committed
    Interrupted,
}

impl IdState {
    /// Whether no further transitions are possible within this run
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            IdState::Succeeded
                | IdState::Tombstoned
                | IdState::Abandoned
                | IdState::StorageFailed
                | IdState::Interrupted
        )
    }

    /// Return `next` if the transition from `self` is legal
    pub fn advance(self, next: IdState) -> Option<IdState> {
        use IdState::*;
        let legal = matches!(
            (self, next),
            (Pending, InFlight)
                | (InFlight, Succeeded)
                | (InFlight, Tombstoned)
                | (InFlight, Retryable)
                | (InFlight, StorageFailed)
                | (InFlight, Interrupted)
                | (Retryable, Pending)
                | (Retryable, Abandoned)
        );
        legal.then_some(next)
    }
}

/// An ID that exhausted its retry budget
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbandonedId {
    /// The replay ID
    pub id: ReplayId,
    /// Number of fetch attempts made
    pub attempts: u32,
    /// Reason given by the last failed attempt
    pub last_error: String,
}

/// An ID whose processing hit a local storage failure
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedId {
    /// The replay ID
    pub id: ReplayId,
    /// Storage error message
    pub error: String,
}

/// Final report of one coordinator run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// First ID of the pass (inclusive)
    pub start: u64,
    /// Last ID of the pass (inclusive), as finally discovered
    pub end: Option<u64>,
    /// IDs newly archived in this run
    pub succeeded: u64,
    /// IDs newly tombstoned in this run
    pub tombstoned: u64,
    /// Successful IDs whose bytes were already present in the blob store
    pub deduplicated: u64,
    /// Total bytes of newly archived replays
    pub bytes_archived: u64,
    /// IDs that exhausted their retry budget
    pub abandoned: Vec<AbandonedId>,
    /// IDs that hit a local storage failure
    pub storage_errors: Vec<FailedId>,
    /// IDs whose in-flight attempt was cancelled by shutdown
    pub interrupted: Vec<ReplayId>,
    /// IDs never dispatched because the run stopped early
    pub not_attempted: u64,
    /// Why the run stopped early because of systemic storage failure
    pub halted: Option<String>,
    /// Whether a shutdown request cut the pass short
    pub cancelled: bool,
}

impl RunSummary {
    /// Whether the pass ran to completion (abandoned IDs do not count against it)
    pub fn is_complete(&self) -> bool {
        self.halted.is_none() && !self.cancelled
    }

    /// Number of ledger records written by this run
    pub fn records_written(&self) -> u64 {
        self.succeeded + self.tombstoned
    }
}

/// Result of an explicit re-verification pass over already archived IDs
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefetchReport {
    /// IDs whose bytes were fetched again with the previously recorded hash
    pub unchanged: Vec<ReplayId>,
    /// IDs whose bytes now hash differently: (id, previous hash, new hash)
    pub changed: Vec<(ReplayId, String, String)>,
    /// IDs the remote now reports as absent (tombstone appended)
    pub now_absent: Vec<ReplayId>,
    /// IDs that could not be refetched: (id, reason)
    pub failed: Vec<(ReplayId, String)>,
    /// Requested IDs with no success record to re-verify
    pub skipped: Vec<ReplayId>,
}

/// Ledger-wide statistics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Distinct IDs with at least one success record
    pub archived_ids: u64,
    /// Distinct IDs whose only records are tombstones
    pub tombstoned_ids: u64,
    /// Total number of ledger rows
    pub total_records: u64,
    /// Sum of sizes over the latest success record of each archived ID
    pub archived_bytes: u64,
    /// Highest replay ID with any record
    pub max_replay_id: Option<u64>,
}

/// Event emitted during an archival run
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A pass started with this many IDs queued
    RunStarted {
        /// First ID (inclusive)
        start: u64,
        /// Last ID (inclusive), None if discovery found nothing to attempt
        end: Option<u64>,
        /// Number of IDs in the initial work set
        queued: usize,
    },

    /// A replay was stored and committed
    Archived {
        /// Replay ID
        id: ReplayId,
        /// Ledger key of the new record
        local_id: LocalId,
        /// Content hash
        sha256: String,
        /// Size in bytes
        size_bytes: u64,
        /// Whether the blob already existed
        deduplicated: bool,
    },

    /// A replay was confirmed absent and tombstoned
    Tombstoned {
        /// Replay ID
        id: ReplayId,
        /// Ledger key of the tombstone record
        local_id: LocalId,
    },

    /// A transient failure was requeued with backoff
    RetryScheduled {
        /// Replay ID
        id: ReplayId,
        /// Attempt number that just failed (1-based)
        attempt: u32,
        /// Backoff before the next attempt
        delay_ms: u64,
        /// Failure reason
        reason: String,
    },

    /// An ID exhausted its retry budget
    Abandoned {
        /// Replay ID
        id: ReplayId,
        /// Attempts made
        attempts: u32,
        /// Last failure reason
        reason: String,
    },

    /// A local storage failure stopped processing of an ID
    StorageFailed {
        /// Replay ID
        id: ReplayId,
        /// Error message
        error: String,
    },

    /// Discovery reported a different upper bound
    UpperBoundChanged {
        /// Previous upper bound
        previous: Option<u64>,
        /// New upper bound
        current: u64,
    },

    /// The pass finished
    RunFinished {
        /// Final report
        summary: RunSummary,
    },
}
