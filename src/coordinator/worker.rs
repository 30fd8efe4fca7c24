//! Processing of a single replay ID: fetch, verify, store, commit.

use crate::blob_store::BlobStore;
use crate::db::Database;
use crate::error::Error;
use crate::fetcher::Fetcher;
use crate::rate_limiter::RequestLimiter;
use crate::retry::IsRetryable;
use crate::types::{FetchOutcome, LocalId, ReplayId};
use crate::verify::verify;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How one attempt for one ID ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// Bytes stored and success committed
    Archived {
        local_id: LocalId,
        sha256: String,
        size_bytes: u64,
        deduplicated: bool,
    },
    /// Remote confirmed absence; tombstone committed
    Tombstoned { local_id: LocalId, status: u16 },
    /// Nothing committed; worth another attempt
    Transient { reason: String },
    /// Local persistence failed; nothing committed
    StorageFailed { error: String },
    /// Shutdown dropped the fetch; nothing committed
    Interrupted,
}

impl Resolution {
    fn from_error(err: Error) -> Self {
        if err.is_retryable() {
            Resolution::Transient {
                reason: err.to_string(),
            }
        } else {
            Resolution::StorageFailed {
                error: err.to_string(),
            }
        }
    }
}

/// Shared handles a worker needs (cheap to clone into each task)
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) db: Arc<Database>,
    pub(crate) blobs: BlobStore,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) limiter: RequestLimiter,
    pub(crate) cancel: CancellationToken,
}

/// Run one attempt for `id`
///
/// Steps are strictly ordered: fetch, verify, store, commit. Cancellation is only
/// observed while waiting for the request slot or the fetch; once bytes are in
/// hand the store and commit run to completion.
pub(crate) async fn process(ctx: &WorkerContext, id: ReplayId) -> Resolution {
    let fetch = async {
        ctx.limiter.acquire().await;
        ctx.fetcher.fetch(id).await
    };

    let outcome = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => {
            tracing::debug!(replay_id = id.0, "Fetch dropped by shutdown");
            return Resolution::Interrupted;
        }
        outcome = fetch => outcome,
    };

    match outcome {
        FetchOutcome::Success { bytes } => archive(ctx, id, &bytes).await,
        FetchOutcome::Absent { status } => match ctx.db.record_absent(id, Utc::now()).await {
            Ok(local_id) => Resolution::Tombstoned { local_id, status },
            Err(e) => Resolution::from_error(e),
        },
        FetchOutcome::Transient { reason } => Resolution::Transient { reason },
    }
}

async fn archive(ctx: &WorkerContext, id: ReplayId, bytes: &[u8]) -> Resolution {
    let digest = match verify(bytes) {
        Ok(digest) => digest,
        Err(e) => return Resolution::from_error(e.into()),
    };

    let stored = match ctx.blobs.store(id, bytes, &digest).await {
        Ok(stored) => stored,
        Err(e) => return Resolution::from_error(e.into()),
    };

    match ctx
        .db
        .record_success(id, &digest.sha256, digest.size_bytes, Utc::now())
        .await
    {
        Ok(local_id) => Resolution::Archived {
            local_id,
            sha256: digest.sha256,
            size_bytes: digest.size_bytes,
            deduplicated: stored.deduplicated,
        },
        Err(e) => Resolution::from_error(e),
    }
}
