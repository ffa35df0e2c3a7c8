use super::*;
use tempfile::TempDir;

fn record(url: &str, lastmod: Option<&str>, image: Option<&str>) -> CheckpointRecord {
    CheckpointRecord {
        url: url.to_string(),
        lastmod: lastmod.map(str::to_string),
        source_locator: Some("https://example.com/sitemap-1.xml".to_string()),
        image_hint: image.map(str::to_string),
    }
}

async fn assert_idempotent_checkpointing(store: &CheckpointStore) {
    let first = record(
        "https://example.com/a.htm",
        Some("2024-05-01T10:00:00+00:00"),
        Some("https://cdn.example.com/a.jpg"),
    );

    assert!(store.upsert(&first).await.unwrap(), "new URL must be emitted");
    assert!(
        !store.upsert(&first).await.unwrap(),
        "identical record must not be re-emitted"
    );

    let newer = record(
        "https://example.com/a.htm",
        Some("2024-05-02T08:00:00+00:00"),
        Some("https://cdn.example.com/a.jpg"),
    );
    assert!(store.upsert(&newer).await.unwrap(), "changed lastmod re-emits");
    assert!(!store.upsert(&newer).await.unwrap());

    let new_image = record(
        "https://example.com/a.htm",
        Some("2024-05-02T08:00:00+00:00"),
        Some("https://cdn.example.com/a-v2.jpg"),
    );
    assert!(
        store.upsert(&new_image).await.unwrap(),
        "changed image hint re-emits"
    );

    let bare = record("https://example.com/a.htm", None, None);
    assert!(
        !store.upsert(&bare).await.unwrap(),
        "a record without lastmod or image carries no change signal"
    );

    let stored = store.get("https://example.com/a.htm").await.unwrap().unwrap();
    assert_eq!(stored.lastmod.as_deref(), Some("2024-05-02T08:00:00+00:00"));
    assert_eq!(
        stored.image_hint.as_deref(),
        Some("https://cdn.example.com/a-v2.jpg")
    );
    assert_eq!(store.len().await.unwrap(), 1);
}

#[tokio::test]
async fn sqlite_backend_checkpoints_idempotently() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::open(&dir.path().join("checkpoint.db"), CheckpointBackend::Sqlite)
        .await
        .unwrap();
    assert_eq!(store.backend_name(), "sqlite");

    assert_idempotent_checkpointing(&store).await;
    store.close().await;
}

#[tokio::test]
async fn json_backend_checkpoints_idempotently() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::open(&dir.path().join("checkpoint.db"), CheckpointBackend::Json)
        .await
        .unwrap();
    assert_eq!(store.backend_name(), "json");

    assert_idempotent_checkpointing(&store).await;
}

#[tokio::test]
async fn keys_ignore_host_case_and_fragment() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::open(&dir.path().join("checkpoint.db"), CheckpointBackend::Sqlite)
        .await
        .unwrap();

    assert!(
        store
            .upsert(&record("https://Example.com/a.htm#top", None, None))
            .await
            .unwrap()
    );
    assert!(
        !store
            .upsert(&record("https://example.com/a.htm", None, None))
            .await
            .unwrap(),
        "canonical URLs share one key"
    );
    assert!(store.contains("example.com/a.htm").await.unwrap());
    store.close().await;
}

#[tokio::test]
async fn json_backend_survives_reopen_and_leaves_no_temp_file() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("state").join("checkpoint.db");

    {
        let store = CheckpointStore::open(&base, CheckpointBackend::Json).await.unwrap();
        store
            .upsert(&record("https://example.com/a.htm", Some("1"), None))
            .await
            .unwrap();
        store
            .upsert(&record("https://example.com/b.htm", Some("1"), None))
            .await
            .unwrap();
    }

    let json_path = dir.path().join("state").join("checkpoint.json");
    assert!(json_path.exists(), "JSON file should be written next to the db path");
    assert!(
        !dir.path().join("state").join("checkpoint.json.tmp").exists(),
        "temp file must be renamed away"
    );

    let reopened = CheckpointStore::open(&base, CheckpointBackend::Json).await.unwrap();
    assert_eq!(reopened.len().await.unwrap(), 2);
    assert!(
        !reopened
            .upsert(&record("https://example.com/a.htm", Some("1"), None))
            .await
            .unwrap(),
        "state must persist across runs"
    );
}

#[tokio::test]
async fn auto_backend_degrades_to_json_when_sqlite_cannot_open() {
    let dir = TempDir::new().unwrap();
    // A directory cannot be opened as a database file
    let blocked = dir.path().join("checkpoint.db");
    std::fs::create_dir_all(&blocked).unwrap();

    let store = CheckpointStore::open(&blocked, CheckpointBackend::Auto).await.unwrap();
    assert_eq!(store.backend_name(), "json");
    assert!(
        store
            .upsert(&record("https://example.com/a.htm", None, None))
            .await
            .unwrap()
    );
    assert!(dir.path().join("checkpoint.json").exists());
}

#[tokio::test]
async fn json_backend_keeps_memory_in_step_with_a_failed_write() {
    let dir = TempDir::new().unwrap();
    let nested = dir.path().join("state");
    let store = JsonCheckpoint::open(&nested.join("checkpoint.json")).await.unwrap();
    let first = record("https://example.com/a.htm", Some("2024-05-01"), None);
    assert!(store.upsert(&first).await.unwrap());

    std::fs::remove_dir_all(&nested).unwrap();

    let newer = record("https://example.com/a.htm", Some("2024-05-02"), None);
    assert!(store.upsert(&newer).await.is_err());
    assert!(store.upsert(&record("https://example.com/b.htm", None, None)).await.is_err());

    assert_eq!(store.len().await, 1, "unwritten URL is not remembered");
    let stored = store.get("https://example.com/a.htm").await.unwrap();
    assert_eq!(stored.lastmod.as_deref(), Some("2024-05-01"));
    assert!(store.upsert(&newer).await.is_err(), "change is still pending");
}
