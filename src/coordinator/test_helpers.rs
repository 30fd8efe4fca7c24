//! Shared test doubles for exercising the coordinator without a network.

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::db::Database;
use crate::discovery::{Discovery, LedgerHighWater};
use crate::fetcher::Fetcher;
use crate::types::{FetchOutcome, ReplayId};
use crate::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tempfile::{TempDir, tempdir};

/// One scripted answer of [`ScriptedFetcher`]
#[derive(Clone, Debug)]
pub(crate) enum Step {
    /// Succeed with `REPLAY-<id>`
    Payload,
    /// Succeed with these bytes
    Bytes(Vec<u8>),
    /// Answer "does not exist"
    Absent,
    /// Fail transiently
    Transient,
    /// Panic inside the worker
    Panic,
    /// Never answer
    Hang,
}

/// Deterministic in-memory [`Fetcher`]
///
/// Each ID consumes its scripted steps in order, then falls back to the default.
pub(crate) struct ScriptedFetcher {
    default: Step,
    scripts: Mutex<HashMap<ReplayId, VecDeque<Step>>>,
    calls: Mutex<HashMap<ReplayId, u32>>,
    total: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    delay: Duration,
}

impl ScriptedFetcher {
    pub(crate) fn new(default: Step) -> Self {
        Self {
            default,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            total: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Hold every answer back for `delay`
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn script(&self, id: u64, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(ReplayId(id), steps.into());
    }

    pub(crate) fn calls(&self, id: u64) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(&ReplayId(id))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn total_calls(&self) -> u32 {
        self.total.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> u32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self, id: ReplayId) -> Step {
        *self.calls.lock().unwrap().entry(id).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::SeqCst);

        self.scripts
            .lock()
            .unwrap()
            .get_mut(&id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Payload the [`Step::Payload`] answer produces for `id`
pub(crate) fn payload_for(id: u64) -> Vec<u8> {
    format!("REPLAY-{}", id).into_bytes()
}

/// Decrements the in-flight gauge even when the fetch future is dropped
struct InFlightGuard<'a>(&'a AtomicU32);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, id: ReplayId) -> FetchOutcome {
        let step = self.next_step(id);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match step {
            Step::Payload => FetchOutcome::Success {
                bytes: payload_for(id.0),
            },
            Step::Bytes(bytes) => FetchOutcome::Success { bytes },
            Step::Absent => FetchOutcome::Absent { status: 404 },
            Step::Transient => FetchOutcome::transient("scripted server error (HTTP 503)"),
            Step::Panic => panic!("scripted fetcher panic for {}", id),
            Step::Hang => std::future::pending().await,
        }
    }
}

/// Discovery that knows nothing, so runs use their explicit end
pub(crate) struct NoBound;

#[async_trait]
impl Discovery for NoBound {
    async fn upper_bound(&self) -> Result<Option<ReplayId>> {
        Ok(None)
    }
}

/// Discovery whose answer tests can move while a run is active
pub(crate) struct MovingBound {
    bounds: Mutex<VecDeque<u64>>,
    last: AtomicU64,
}

impl MovingBound {
    /// Report `bounds` in order, then keep repeating the last one
    pub(crate) fn new(bounds: Vec<u64>) -> Self {
        let last = bounds.first().copied().unwrap_or(0);
        Self {
            bounds: Mutex::new(bounds.into()),
            last: AtomicU64::new(last),
        }
    }
}

#[async_trait]
impl Discovery for MovingBound {
    async fn upper_bound(&self) -> Result<Option<ReplayId>> {
        if let Some(next) = self.bounds.lock().unwrap().pop_front() {
            self.last.store(next, Ordering::SeqCst);
        }
        Ok(Some(ReplayId(self.last.load(Ordering::SeqCst))))
    }
}

/// Config with fast, deterministic retries and storage inside `dir`
pub(crate) fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.database_path = dir.path().join("replays.db");
    config.storage.archive_dir = dir.path().join("replays");
    config.archive.concurrency = 4;
    config.archive.rediscover_interval = Duration::from_secs(3600);
    config.retry.initial_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(40);
    config.retry.backoff_multiplier = 2.0;
    config.retry.jitter = false;
    config
}

/// Build a coordinator over `fetcher` with a fresh ledger and archive
///
/// Returns the tempdir, which must be kept alive for the test's duration.
pub(crate) async fn create_test_coordinator(
    fetcher: Arc<ScriptedFetcher>,
    configure: impl FnOnce(&mut Config),
) -> (Coordinator, TempDir) {
    let dir = tempdir().unwrap();
    let mut config = test_config(&dir);
    configure(&mut config);

    let coordinator = coordinator_with(config, fetcher, Arc::new(NoBound)).await;
    (coordinator, dir)
}

/// Build a coordinator from an explicit config (reopening the same paths
/// simulates a process restart)
pub(crate) async fn coordinator_with(
    config: Config,
    fetcher: Arc<dyn Fetcher>,
    discovery: Arc<dyn Discovery>,
) -> Coordinator {
    let db = Arc::new(Database::new(&config.storage.database_path).await.unwrap());
    Coordinator::with_parts(config, db, fetcher, discovery)
        .await
        .unwrap()
}

/// Build a coordinator that discovers its upper bound from the ledger, probing
/// `window` IDs past the highest archived one
pub(crate) async fn create_probing_coordinator(
    fetcher: Arc<ScriptedFetcher>,
    window: u64,
    configure: impl FnOnce(&mut Config),
) -> (Coordinator, TempDir) {
    let dir = tempdir().unwrap();
    let mut config = test_config(&dir);
    configure(&mut config);

    let db = Arc::new(Database::new(&config.storage.database_path).await.unwrap());
    let discovery = Arc::new(LedgerHighWater::new(db.clone(), ReplayId(0), window));
    let coordinator = Coordinator::with_parts(config, db, fetcher, discovery)
        .await
        .unwrap();
    (coordinator, dir)
}
