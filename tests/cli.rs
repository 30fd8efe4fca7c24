//! Tests for the `replay-archiver` binary: subcommands and exit codes

mod common;

use common::{mount_replay, mount_status};
use std::path::Path;
use std::process::Output;
use tempfile::TempDir;
use tokio::process::Command;
use wiremock::MockServer;

async fn archiver(dir: &TempDir, server_uri: &str, args: &[&str]) -> Output {
    let base_url = format!("{}/api/download_file?id={{id}}", server_uri);
    Command::new(env!("CARGO_BIN_EXE_replay-archiver"))
        .arg("--db")
        .arg(dir.path().join("ledger.db"))
        .arg("--output")
        .arg(dir.path().join("replays"))
        .args(["--base-url", &base_url])
        .args(args)
        .output()
        .await
        .expect("failed to launch replay-archiver")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[tokio::test]
async fn test_run_status_and_export() {
    let server = MockServer::start().await;
    mount_replay(&server, 0, b"REPLAY-A").await;
    mount_status(&server, 1, 400).await;
    mount_replay(&server, 2, b"REPLAY-B").await;
    let dir = tempfile::tempdir().unwrap();

    let run = archiver(&dir, &server.uri(), &["run", "--start", "0", "--end", "2"]).await;
    assert_eq!(run.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&run.stderr));
    assert!(stdout(&run).contains("abandoned:      0"));

    let status = archiver(&dir, &server.uri(), &["status", "--json"]).await;
    assert_eq!(status.status.code(), Some(0));
    let value: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(value["ledger"]["archived_ids"], 2);
    assert_eq!(value["ledger"]["tombstoned_ids"], 1);
    assert_eq!(value["unclean_shutdown"], false);

    let target = dir.path().join("out").join("zero.mcpr");
    let export = archiver(
        &dir,
        &server.uri(),
        &["export", "--replay-id", "0", "--output-file", target.to_str().unwrap()],
    )
    .await;
    assert_eq!(export.status.code(), Some(0));
    assert_eq!(std::fs::read(&target).unwrap(), b"REPLAY-A");

    // Refusing to overwrite is a failure
    let again = archiver(
        &dir,
        &server.uri(),
        &["export", "--replay-id", "0", "--output-file", target.to_str().unwrap()],
    )
    .await;
    assert_eq!(again.status.code(), Some(1));
}

#[tokio::test]
async fn test_export_into_directory_keeps_blob_name() {
    let server = MockServer::start().await;
    mount_replay(&server, 4, b"REPLAY-4").await;
    let dir = tempfile::tempdir().unwrap();

    let run = archiver(&dir, &server.uri(), &["run", "--start", "4", "--end", "4"]).await;
    assert_eq!(run.status.code(), Some(0));

    let out = dir.path().join("exported");
    let export = archiver(
        &dir,
        &server.uri(),
        &["export", "--replay-id", "4", "--output-dir", out.to_str().unwrap()],
    )
    .await;
    assert_eq!(export.status.code(), Some(0));

    let written = stdout(&export);
    let written = Path::new(written.trim());
    assert!(written.starts_with(&out));
    assert_eq!(std::fs::read(written).unwrap(), b"REPLAY-4");
}

#[tokio::test]
async fn test_inverted_range_exits_with_startup_error() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let run = archiver(&dir, &server.uri(), &["run", "--start", "5", "--end", "1"]).await;

    assert_eq!(run.status.code(), Some(1));
    assert!(stdout(&run).contains("abandoned:      0"));

    let json_run = archiver(
        &dir,
        &server.uri(),
        &["run", "--json", "--start", "5", "--end", "1"],
    )
    .await;
    assert_eq!(json_run.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_str(&stdout(&json_run)).unwrap();
    assert_eq!(report["abandoned"], serde_json::json!([]));
    assert!(report["error"].as_str().unwrap().contains("5"));

    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_export_of_unarchived_id_fails() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let target = dir.path().join("missing.mcpr");
    let export = archiver(
        &dir,
        &server.uri(),
        &["export", "--replay-id", "99", "--output-file", target.to_str().unwrap()],
    )
    .await;

    assert_eq!(export.status.code(), Some(1));
    assert!(!target.exists());
}

#[tokio::test]
async fn test_refetch_reports_unchanged_replay() {
    let server = MockServer::start().await;
    mount_replay(&server, 0, b"REPLAY-A").await;
    let dir = tempfile::tempdir().unwrap();

    let run = archiver(&dir, &server.uri(), &["run", "--start", "0", "--end", "0"]).await;
    assert_eq!(run.status.code(), Some(0));

    let refetch = archiver(&dir, &server.uri(), &["refetch", "0", "--json"]).await;
    assert_eq!(refetch.status.code(), Some(0));
    let report: serde_json::Value = serde_json::from_slice(&refetch.stdout).unwrap();
    assert_eq!(report["unchanged"], serde_json::json!([0]));
}
