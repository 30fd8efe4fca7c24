//! Test configuration helpers pointing the archiver at a mock endpoint

use replay_archiver::{Config, Coordinator};
use std::time::Duration;
use tempfile::TempDir;

/// Config with storage inside `dir` and the download endpoint on `server_uri`
///
/// Retries are fast and jitter-free so tests stay deterministic.
pub fn create_test_config(server_uri: &str, dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.source.base_url = format!("{}/api/download_file?id={{id}}", server_uri);
    config.source.request_timeout = Duration::from_secs(5);
    config.storage.database_path = dir.path().join("ledger.db");
    config.storage.archive_dir = dir.path().join("replays");
    config.archive.concurrency = 2;
    config.retry.initial_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(50);
    config.retry.jitter = false;
    config
}

/// Build a coordinator with a fresh ledger against `server_uri`
///
/// Returns the tempdir, which must be kept alive for the test's duration.
pub async fn create_test_coordinator(server_uri: &str) -> (Coordinator, TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let config = create_test_config(server_uri, &dir);
    let coordinator = Coordinator::new(config)
        .await
        .expect("failed to create coordinator");
    (coordinator, dir)
}
