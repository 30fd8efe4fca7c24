//! End-to-end archival against a mock download endpoint
//!
//! These tests drive the real HTTP fetcher, SQLite ledger and on-disk blob store.
//! The endpoint is a local wiremock server, so no network access is required.
//!
//! # Running the tests
//!
//! ```bash
//! cargo test --test end_to_end
//! ```

mod common;

use common::{
    count_blob_files, create_test_config, create_test_coordinator, drain_events,
    mount_flaky_replay, mount_replay, mount_status, requests_for, staged_files,
};
use replay_archiver::{Coordinator, Event, ReplayId};
use wiremock::MockServer;

#[tokio::test]
async fn test_archives_replays_and_tombstones_missing_ids() {
    let server = MockServer::start().await;
    mount_replay(&server, 0, b"REPLAY-A").await;
    mount_status(&server, 1, 400).await;
    mount_replay(&server, 2, b"REPLAY-B").await;

    let (coordinator, dir) = create_test_coordinator(&server.uri()).await;
    let summary = coordinator
        .run(ReplayId(0), Some(ReplayId(2)))
        .await
        .expect("run failed");

    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.tombstoned, 1);
    assert!(summary.is_complete());

    assert_eq!(coordinator.db.count_records().await.unwrap(), 3);
    let absent = coordinator.db.latest_record(ReplayId(1)).await.unwrap().unwrap();
    assert!(absent.sha256.is_none());
    assert!(absent.size_bytes.is_none());

    let archive = dir.path().join("replays");
    assert_eq!(count_blob_files(&archive, "mcpr"), 2);
    assert_eq!(staged_files(&archive), 0);

    let first = coordinator.db.latest_success(ReplayId(0)).await.unwrap().unwrap();
    let bytes = coordinator
        .blob_store()
        .read(first.sha256.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(bytes, b"REPLAY-A");
    assert_eq!(first.size_bytes, Some(8));
}

#[tokio::test]
async fn test_rerun_sends_no_requests() {
    let server = MockServer::start().await;
    mount_replay(&server, 0, b"REPLAY-A").await;
    mount_status(&server, 1, 404).await;

    let (coordinator, _dir) = create_test_coordinator(&server.uri()).await;
    coordinator.run(ReplayId(0), Some(ReplayId(1))).await.unwrap();
    let requests = server.received_requests().await.unwrap().len();
    assert_eq!(requests, 2);

    let summary = coordinator.run(ReplayId(0), Some(ReplayId(1))).await.unwrap();

    assert_eq!(summary.records_written(), 0);
    assert_eq!(server.received_requests().await.unwrap().len(), requests);
    assert_eq!(coordinator.db.count_records().await.unwrap(), 2);
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let server = MockServer::start().await;
    mount_flaky_replay(&server, 7, 2, b"REPLAY-7").await;

    let (coordinator, _dir) = create_test_coordinator(&server.uri()).await;
    let mut events = coordinator.subscribe();
    let summary = coordinator.run(ReplayId(7), Some(ReplayId(7))).await.unwrap();

    assert_eq!(summary.succeeded, 1);
    assert!(summary.abandoned.is_empty());
    assert_eq!(requests_for(&server, 7).await, 3);

    let retries = drain_events(&mut events)
        .into_iter()
        .filter(|event| matches!(event, Event::RetryScheduled { .. }))
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_persistent_server_errors_abandon_only_that_id() {
    let server = MockServer::start().await;
    mount_status(&server, 0, 500).await;
    mount_replay(&server, 1, b"REPLAY-1").await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = create_test_config(&server.uri(), &dir);
    config.retry.max_attempts = 3;
    let coordinator = Coordinator::new(config).await.unwrap();

    let summary = coordinator.run(ReplayId(0), Some(ReplayId(1))).await.unwrap();

    assert_eq!(requests_for(&server, 0).await, 3);
    assert_eq!(summary.abandoned.len(), 1);
    assert_eq!(summary.abandoned[0].id, ReplayId(0));
    assert_eq!(summary.succeeded, 1);
    assert!(summary.is_complete());
    assert!(coordinator.db.latest_record(ReplayId(0)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_open_ended_run_stops_at_configured_max_id() {
    let server = MockServer::start().await;
    for id in 0..=3 {
        mount_replay(&server, id, format!("REPLAY-{}", id).as_bytes()).await;
    }

    let dir = tempfile::tempdir().unwrap();
    let mut config = create_test_config(&server.uri(), &dir);
    config.source.max_id = Some(3);
    let coordinator = Coordinator::new(config).await.unwrap();

    let summary = coordinator.run(ReplayId(0), None).await.unwrap();

    assert_eq!(summary.end, Some(3));
    assert_eq!(summary.succeeded, 4);
    assert_eq!(requests_for(&server, 4).await, 0);
}

#[tokio::test]
async fn test_restart_with_new_coordinator_resumes() {
    let server = MockServer::start().await;
    for id in 0..=5 {
        mount_replay(&server, id, format!("REPLAY-{}", id).as_bytes()).await;
    }

    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(&server.uri(), &dir);

    let first = Coordinator::new(config.clone()).await.unwrap();
    first.run(ReplayId(0), Some(ReplayId(2))).await.unwrap();
    drop(first);

    let second = Coordinator::new(config).await.unwrap();
    let summary = second.run(ReplayId(0), Some(ReplayId(5))).await.unwrap();

    assert_eq!(summary.succeeded, 3);
    for id in 0..=5 {
        assert_eq!(requests_for(&server, id).await, 1, "replay {}", id);
    }
    assert_eq!(count_blob_files(&dir.path().join("replays"), "mcpr"), 6);
}
