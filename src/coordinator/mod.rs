//! Archival coordinator split into focused submodules.
//!
//! The [`Coordinator`] owns the per-run work set, dispatches replay IDs to a
//! bounded worker pool and turns each worker's resolution into ledger writes,
//! events and summary counters:
//! - [`run`] - One archival pass over an ID range
//! - [`refetch`] - Explicit re-verification of archived IDs
//! - [`work_set`] - Per-ID state machine and backoff queue
//! - [`worker`] - Fetch, verify, store and commit for a single ID

mod refetch;
mod run;
mod work_set;
mod worker;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

use crate::blob_store::BlobStore;
use crate::config::Config;
use crate::db::Database;
use crate::discovery::{Discovery, FixedUpperBound, LedgerHighWater};
use crate::error::Result;
use crate::fetcher::{Fetcher, HttpFetcher};
use crate::rate_limiter::RequestLimiter;
use crate::types::{Event, ReplayId};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Buffered events per subscriber before it starts lagging
const EVENT_BUFFER: usize = 1000;

/// Drives archival passes (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct Coordinator {
    /// Ledger handle, public so callers can inspect progress
    pub db: Arc<Database>,
    /// Content-addressed replay storage
    pub(crate) blobs: BlobStore,
    /// One-attempt fetcher for the remote endpoint
    pub(crate) fetcher: Arc<dyn Fetcher>,
    /// Source of the ID space upper bound
    pub(crate) discovery: Arc<dyn Discovery>,
    /// Request rate cap shared by all workers
    pub(crate) limiter: RequestLimiter,
    /// Validated configuration
    pub(crate) config: Arc<Config>,
    /// Event broadcast channel sender
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Cancelled on graceful shutdown
    pub(crate) cancel: CancellationToken,
}

impl Coordinator {
    /// Create a coordinator from configuration alone
    ///
    /// Opens the ledger and blob store, builds an [`HttpFetcher`] for the
    /// configured endpoint, and picks the discovery strategy: a fixed bound when
    /// `source.max_id` is set, otherwise probing past the ledger's high water mark.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let db = Arc::new(Database::new(&config.storage.database_path).await?);
        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(config.source.clone())?);

        let discovery: Arc<dyn Discovery> = match config.source.max_id {
            Some(max_id) => Arc::new(FixedUpperBound(ReplayId(max_id))),
            None => Arc::new(LedgerHighWater::new(
                db.clone(),
                ReplayId(config.archive.start_id),
                config.source.probe_window,
            )),
        };

        tracing::info!(
            base_url = %config.source.base_url,
            database = %config.storage.database_path.display(),
            archive = %config.storage.archive_dir.display(),
            concurrency = config.archive.concurrency,
            "Coordinator initialized"
        );

        Self::with_parts(config, db, fetcher, discovery).await
    }

    /// Create a coordinator around caller-supplied collaborators
    pub async fn with_parts(
        config: Config,
        db: Arc<Database>,
        fetcher: Arc<dyn Fetcher>,
        discovery: Arc<dyn Discovery>,
    ) -> Result<Self> {
        config.validate()?;

        let blobs = BlobStore::new(
            &config.storage.archive_dir,
            config.storage.blob_extension.clone(),
        )
        .await?;
        let limiter = RequestLimiter::new(config.source.requests_per_second);
        let (event_tx, _rx) = broadcast::channel(EVENT_BUFFER);

        Ok(Self {
            db,
            blobs,
            fetcher,
            discovery,
            limiter,
            config: Arc::new(config),
            event_tx,
            cancel: CancellationToken::new(),
        })
    }

    /// Subscribe to run events
    ///
    /// Each subscriber receives every event independently. A subscriber that falls
    /// more than 1000 events behind receives `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Request a graceful shutdown of any active run
    ///
    /// No new IDs are dispatched; in-flight fetches are dropped and whatever
    /// already passed the fetch is committed before [`Coordinator::run`] returns.
    pub fn shutdown(&self) {
        tracing::info!("Shutdown requested");
        self.cancel.cancel();
    }

    /// Token cancelled by [`Coordinator::shutdown`]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The blob store replays are archived into
    pub fn blob_store(&self) -> &BlobStore {
        &self.blobs
    }

    /// The configuration this coordinator runs with
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn emit(&self, event: Event) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}
