//! Discovery of the upper bound of the remote ID space
//!
//! The remote endpoint does not advertise how many replays exist, so the
//! coordinator asks a [`Discovery`] collaborator. The answer is advisory and
//! re-queried periodically during a run; it may grow while the run is active.

use crate::db::Database;
use crate::types::ReplayId;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Source of the current highest replay ID worth attempting
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Current upper bound (inclusive), or None if nothing is known to exist
    async fn upper_bound(&self) -> Result<Option<ReplayId>>;
}

/// A fixed, configured upper bound
#[derive(Clone, Copy, Debug)]
pub struct FixedUpperBound(pub ReplayId);

#[async_trait]
impl Discovery for FixedUpperBound {
    async fn upper_bound(&self) -> Result<Option<ReplayId>> {
        Ok(Some(self.0))
    }
}

/// Probes past the highest ID already archived
///
/// Reports `max(highest archived ID, floor) + probe_window`. Only successful
/// records move the mark: tombstones written while probing past the live tail
/// leave it in place, so an unchanged remote yields an unchanged bound.
pub struct LedgerHighWater {
    db: Arc<Database>,
    floor: ReplayId,
    probe_window: u64,
}

impl LedgerHighWater {
    /// Probe `probe_window` IDs beyond the highest archived ID (or beyond `floor`
    /// if nothing is archived yet or the archive is behind it)
    pub fn new(db: Arc<Database>, floor: ReplayId, probe_window: u64) -> Self {
        Self {
            db,
            floor,
            probe_window,
        }
    }
}

#[async_trait]
impl Discovery for LedgerHighWater {
    async fn upper_bound(&self) -> Result<Option<ReplayId>> {
        let high_water = self
            .db
            .max_archived_id()
            .await?
            .map_or(self.floor, |max| max.max(self.floor));

        Ok(Some(ReplayId(high_water.0.saturating_add(self.probe_window))))
    }
}
