//! SQLite checkpoint backend

use super::{CheckpointRecord, checkpoint_key};
use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use std::path::Path;
use std::str::FromStr;

/// Checkpoint table in its own SQLite file
pub struct SqliteCheckpoint {
    pool: SqlitePool,
}

impl SqliteCheckpoint {
    /// Open (and create) the checkpoint database
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to create checkpoint directory: {}",
                    e
                )))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to parse checkpoint path: {}",
                    e
                )))
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to open checkpoint database: {}",
                e
            )))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                url_hash TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                lastmod TEXT,
                source_locator TEXT,
                image_hint TEXT,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create checkpoints table: {}",
                e
            )))
        })?;

        Ok(Self { pool })
    }

    /// Insert or update in one statement
    ///
    /// The `DO UPDATE ... WHERE` clause only fires when a non-null incoming
    /// `lastmod`/`image_hint` differs from the stored one, so `rows_affected`
    /// is 1 exactly when the URL is new or changed.
    pub async fn upsert(&self, record: &CheckpointRecord) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO checkpoints (url_hash, url, lastmod, source_locator, image_hint, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(url_hash) DO UPDATE SET
                url = excluded.url,
                lastmod = COALESCE(excluded.lastmod, checkpoints.lastmod),
                source_locator = COALESCE(excluded.source_locator, checkpoints.source_locator),
                image_hint = COALESCE(excluded.image_hint, checkpoints.image_hint),
                updated_at = excluded.updated_at
            WHERE (excluded.lastmod IS NOT NULL AND excluded.lastmod IS NOT checkpoints.lastmod)
               OR (excluded.image_hint IS NOT NULL AND excluded.image_hint IS NOT checkpoints.image_hint)
            "#,
        )
        .bind(record.key())
        .bind(&record.url)
        .bind(&record.lastmod)
        .bind(&record.source_locator)
        .bind(&record.image_hint)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to upsert checkpoint: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Fetch the stored record for a URL
    pub async fn get(&self, url: &str) -> Result<Option<CheckpointRecord>> {
        let row: Option<(String, Option<String>, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT url, lastmod, source_locator, image_hint FROM checkpoints WHERE url_hash = ?",
        )
        .bind(checkpoint_key(url))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to read checkpoint: {}",
                e
            )))
        })?;

        Ok(
            row.map(|(url, lastmod, source_locator, image_hint)| CheckpointRecord {
                url,
                lastmod,
                source_locator,
                image_hint,
            }),
        )
    }

    /// Number of stored URLs
    pub async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM checkpoints")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count checkpoints: {}",
                    e
                )))
            })?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Close the pool
    pub async fn close(self) {
        self.pool.close().await;
    }
}
