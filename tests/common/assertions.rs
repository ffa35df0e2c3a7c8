//! Assertions over the database and the storage volume

use news_ingest::db::TaskStatus;
use news_ingest::{AppContext, ArticleId};
use std::path::Path;

/// Task totals by status
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub queued: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
}

/// Count tasks in every status
pub async fn task_counts(ctx: &AppContext) -> TaskCounts {
    let count = |status| async move { ctx.db.count_tasks(status).await.expect("Failed to count tasks") };
    TaskCounts {
        queued: count(TaskStatus::Queued).await,
        running: count(TaskStatus::Running).await,
        succeeded: count(TaskStatus::Succeeded).await,
        failed: count(TaskStatus::Failed).await,
    }
}

/// Files with a `.part` extension anywhere below `root`
pub fn partial_files(root: &Path) -> Vec<std::path::PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == "part") {
                found.push(path);
            }
        }
    }
    found
}

/// Assert no `.part` file is left below `root`
pub fn assert_no_partials(root: &Path) {
    let partials = partial_files(root);
    assert!(partials.is_empty(), "leftover partial files: {partials:?}");
}

/// Stored asset paths of an article as `kind/sequence` pairs
pub async fn stored_assets(ctx: &AppContext, article_id: ArticleId) -> Vec<(String, i64)> {
    ctx.db
        .list_assets(article_id)
        .await
        .expect("Failed to list assets")
        .into_iter()
        .map(|row| (row.kind, row.sequence))
        .collect()
}

/// Parse every line of an NDJSON file
pub fn read_ndjson(path: &Path) -> Vec<serde_json::Value> {
    let raw = std::fs::read_to_string(path).unwrap_or_default();
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("Invalid NDJSON line"))
        .collect()
}
