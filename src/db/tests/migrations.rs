use crate::db::*;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_database_creation() {
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path();

    let db = Database::new(db_path).await.unwrap();

    let mut conn = db.pool.acquire().await.unwrap();

    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(&mut *conn)
            .await
            .unwrap();

    assert!(tables.contains(&"replays".to_string()));
    assert!(tables.contains(&"schema_version".to_string()));
    assert!(tables.contains(&"runtime_state".to_string()));

    drop(conn);
    db.close().await;
}

#[tokio::test]
async fn test_database_creates_parent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("nested").join("ledger").join("replays.db");

    let db = Database::new(&db_path).await.unwrap();
    assert!(db_path.exists());

    db.close().await;
}

#[tokio::test]
async fn test_migrations_are_idempotent_across_reopen() {
    let temp_file = NamedTempFile::new().unwrap();

    {
        let db = Database::new(temp_file.path()).await.unwrap();
        db.record_absent(ReplayId(3), chrono::Utc::now()).await.unwrap();
        db.close().await;
    }

    let db = Database::new(temp_file.path()).await.unwrap();

    let versions: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_version")
        .fetch_all(db.pool())
        .await
        .unwrap();
    assert_eq!(versions, vec![1], "v1 must be recorded exactly once");

    // Existing rows survive reopening
    assert_eq!(db.count_records().await.unwrap(), 1);

    db.close().await;
}

#[tokio::test]
async fn test_schema_rejects_half_filled_rows() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    // A hash without a size is neither a success nor a tombstone
    let result = sqlx::query(
        "INSERT INTO replays (replay_id, sha256, size_bytes, fetched_at) VALUES (1, 'ab', NULL, 0)",
    )
    .execute(db.pool())
    .await;
    assert!(result.is_err());

    let result = sqlx::query(
        "INSERT INTO replays (replay_id, sha256, size_bytes, fetched_at) VALUES (-1, NULL, NULL, 0)",
    )
    .execute(db.pool())
    .await;
    assert!(result.is_err(), "negative replay IDs must be rejected");

    db.close().await;
}

#[tokio::test]
async fn test_database_uses_wal_and_full_sync() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let mut conn = db.pool().acquire().await.unwrap();

    let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(&mut *conn)
        .await
        .unwrap();
    assert_eq!(journal_mode.to_lowercase(), "wal");

    // FULL == 2
    let synchronous: i64 = sqlx::query_scalar("PRAGMA synchronous")
        .fetch_one(&mut *conn)
        .await
        .unwrap();
    assert_eq!(synchronous, 2);

    drop(conn);
    db.close().await;
}
