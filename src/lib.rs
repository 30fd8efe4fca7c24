//! # replay-archiver
//!
//! Resumable, idempotent archiver for numbered replay artifacts.
//!
//! Replays are addressed by a monotonically increasing integer ID on a remote
//! download endpoint. Each pass walks an ID range, downloads every ID the ledger
//! has not resolved yet, and either stores the bytes in a content-addressed blob
//! store or records a tombstone when the endpoint reports the ID does not exist.
//!
//! ## Design Philosophy
//!
//! - **Crash-safe** - A blob is durable on disk before its ledger row commits
//! - **Idempotent** - Re-running a range never fetches a resolved ID again
//! - **Polite** - Bounded concurrency, optional request rate cap, backoff on errors
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use replay_archiver::{Config, Coordinator, ReplayId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.source.max_id = Some(1000);
//!
//!     let coordinator = Coordinator::new(config).await?;
//!
//!     let mut events = coordinator.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let summary = coordinator.run(ReplayId(0), None).await?;
//!     println!("archived {} replays", summary.succeeded);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Content-addressed replay storage
pub mod blob_store;
/// Configuration types
pub mod config;
/// Archival coordinator (decomposed into focused submodules)
pub mod coordinator;
/// Durable ledger of fetch outcomes
pub mod db;
/// Upper bound discovery for open-ended runs
pub mod discovery;
/// Error types
pub mod error;
/// Single-attempt HTTP fetcher
pub mod fetcher;
/// Request rate limiting with token bucket
pub mod rate_limiter;
/// Retry classification and exponential backoff
pub mod retry;
/// Core types and events
pub mod types;
/// Payload hashing and integrity checks
pub mod verify;

// Re-export commonly used types
pub use blob_store::{BlobCheck, BlobStore, StorageRef};
pub use config::{ArchiveConfig, Config, RetryConfig, SourceConfig, StorageConfig};
pub use coordinator::Coordinator;
pub use db::Database;
pub use discovery::{Discovery, FixedUpperBound, LedgerHighWater};
pub use error::{DatabaseError, Error, IntegrityError, Result, StorageError};
pub use fetcher::{Fetcher, HttpFetcher};
pub use types::{
    AbandonedId, Event, FailedId, FetchOutcome, LedgerStats, LocalId, Record, RefetchReport,
    ReplayId, RunSummary,
};

/// Run one archival pass, shutting down gracefully on a termination signal.
///
/// The first SIGINT/SIGTERM calls the coordinator's `shutdown()`; the pass then
/// drains in-flight work and returns its summary with `cancelled` set.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use replay_archiver::{Config, Coordinator, ReplayId, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let coordinator = Coordinator::new(Config::default()).await?;
///     let summary = run_with_shutdown(&coordinator, ReplayId(0), None).await?;
///     println!("cancelled: {}", summary.cancelled);
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(
    coordinator: &Coordinator,
    start: ReplayId,
    end: Option<ReplayId>,
) -> Result<RunSummary> {
    let signalled = coordinator.clone();
    let watcher = tokio::spawn(async move {
        wait_for_signal().await;
        signalled.shutdown();
    });

    let result = coordinator.run(start, end).await;
    watcher.abort();
    result
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments (containers, tests)
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("SIGTERM received, stopping archival pass"),
                _ = sigint.recv() => tracing::info!("SIGINT received, stopping archival pass"),
            }
        }
        (Ok(mut only), Err(e)) | (Err(e), Ok(mut only)) => {
            tracing::warn!(error = %e, "Could not register one signal handler, listening on the other");
            only.recv().await;
            tracing::info!("Termination signal received, stopping archival pass");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "Could not register signal handlers, using ctrl_c fallback");
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Ctrl+C received, stopping archival pass"),
                // Without any signal source the pass simply runs to completion
                Err(_) => std::future::pending::<()>().await,
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Ctrl+C received, stopping archival pass"),
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}
