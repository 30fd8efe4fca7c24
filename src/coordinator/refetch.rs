//! Explicit re-verification of already archived IDs.

use crate::error::Result;
use crate::types::{Event, RefetchReport, ReplayId};
use futures::StreamExt;
use std::collections::BTreeSet;

use super::Coordinator;
use super::worker::{self, Resolution, WorkerContext};

impl Coordinator {
    /// Download archived replays again and compare their content hash
    ///
    /// Only IDs that already have a success record are refetched; others are
    /// reported as skipped. Every resolved attempt appends a new ledger row, so
    /// the history of each ID stays auditable. Transient failures are reported,
    /// not retried.
    pub async fn refetch(&self, ids: &[ReplayId]) -> Result<RefetchReport> {
        let mut report = RefetchReport::default();
        let requested: BTreeSet<ReplayId> = ids.iter().copied().collect();

        let mut targets = Vec::with_capacity(requested.len());
        for id in requested {
            match self.db.latest_success(id).await? {
                Some(record) => {
                    if let Some(sha256) = record.sha256 {
                        targets.push((id, sha256));
                    }
                }
                None => {
                    tracing::info!(replay_id = id.0, "No archived copy to re-verify, skipping");
                    report.skipped.push(id);
                }
            }
        }

        let ctx = WorkerContext {
            db: self.db.clone(),
            blobs: self.blobs.clone(),
            fetcher: self.fetcher.clone(),
            limiter: self.limiter.clone(),
            cancel: self.cancel.clone(),
        };

        let mut results = futures::stream::iter(targets)
            .map(|(id, previous)| {
                let ctx = ctx.clone();
                async move { (id, previous, worker::process(&ctx, id).await) }
            })
            .buffer_unordered(self.config.archive.concurrency);

        while let Some((id, previous, resolution)) = results.next().await {
            match resolution {
                Resolution::Archived {
                    local_id,
                    sha256,
                    size_bytes,
                    deduplicated,
                } => {
                    self.emit(Event::Archived {
                        id,
                        local_id,
                        sha256: sha256.clone(),
                        size_bytes,
                        deduplicated,
                    });
                    if sha256 == previous {
                        tracing::info!(replay_id = id.0, "Re-verified replay, content unchanged");
                        report.unchanged.push(id);
                    } else {
                        tracing::warn!(
                            replay_id = id.0,
                            previous = %previous,
                            current = %sha256,
                            "Replay content changed since it was archived"
                        );
                        report.changed.push((id, previous, sha256));
                    }
                }
                Resolution::Tombstoned { local_id, .. } => {
                    tracing::warn!(replay_id = id.0, "Archived replay is now absent upstream");
                    self.emit(Event::Tombstoned { id, local_id });
                    report.now_absent.push(id);
                }
                Resolution::Transient { reason } => report.failed.push((id, reason)),
                Resolution::StorageFailed { error } => report.failed.push((id, error)),
                Resolution::Interrupted => {
                    report.failed.push((id, "interrupted by shutdown".to_string()));
                }
            }
        }

        report.unchanged.sort();
        report.changed.sort();
        report.now_absent.sort();
        report.failed.sort();

        Ok(report)
    }
}
