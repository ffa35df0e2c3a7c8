//! Connection setup and versioned schema

use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::Database;

fn connection_failed(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::Database(DatabaseError::ConnectionFailed(format!("{context}: {e}")))
}

fn migration_failed(context: String) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::Database(DatabaseError::MigrationFailed(format!("{context}: {e}")))
}

impl Database {
    /// Open (or create) the SQLite file at `path` and bring its schema up to date
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "cannot create {}: {e}",
                    dir.display()
                )))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(connection_failed("invalid database path"))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(connection_failed("cannot open database"))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(connection_failed("no pooled connection"))?;

        sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL)")
            .execute(&mut *conn)
            .await
            .map_err(migration_failed("schema_version table".to_string()))?;

        let applied: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(&mut *conn)
            .await
            .map_err(migration_failed("reading schema version".to_string()))?;

        if applied < 1 {
            Self::migrate_v1(&mut conn).await?;
        }
        if applied < 2 {
            Self::migrate_v2(&mut conn).await?;
        }
        Ok(())
    }

    /// Run `statements` and record `version`, all or nothing
    async fn apply_migration(conn: &mut SqliteConnection, version: i64, statements: &[&str]) -> Result<()> {
        tracing::info!(version, "Applying schema migration");

        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(migration_failed(format!("v{version} begin")))?;

        let applied = async {
            for statement in statements {
                sqlx::query(statement)
                    .execute(&mut *conn)
                    .await
                    .map_err(migration_failed(format!("v{version}")))?;
            }
            sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
                .bind(version)
                .bind(chrono::Utc::now().timestamp())
                .execute(&mut *conn)
                .await
                .map_err(migration_failed(format!("v{version} bookkeeping")))?;
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = applied {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            return Err(e);
        }
        sqlx::query("COMMIT")
            .execute(&mut *conn)
            .await
            .map_err(migration_failed(format!("v{version} commit")))?;
        Ok(())
    }

    /// Migration v1: articles, stored assets, media bookkeeping
    async fn migrate_v1(conn: &mut SqliteConnection) -> Result<()> {
        Self::apply_migration(
            conn,
            1,
            &[
                r#"
                CREATE TABLE articles (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    site_slug TEXT NOT NULL,
                    url TEXT NOT NULL UNIQUE,
                    title TEXT NOT NULL,
                    description TEXT,
                    content TEXT NOT NULL,
                    category_id TEXT,
                    category_name TEXT,
                    tags TEXT,
                    publish_date INTEGER,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                )
                "#,
                "CREATE INDEX idx_articles_site ON articles(site_slug)",
                r#"
                CREATE TABLE article_assets (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                    kind TEXT NOT NULL,
                    sequence INTEGER NOT NULL,
                    path TEXT NOT NULL,
                    source_url TEXT NOT NULL,
                    checksum TEXT NOT NULL,
                    bytes INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    UNIQUE(article_id, kind, sequence)
                )
                "#,
                r#"
                CREATE TABLE deferred_videos (
                    article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                    sequence INTEGER NOT NULL,
                    site_slug TEXT NOT NULL,
                    article_url TEXT NOT NULL,
                    source_url TEXT NOT NULL,
                    referrer TEXT,
                    caption TEXT,
                    category_id TEXT,
                    category_name TEXT,
                    category_key TEXT,
                    ingest_category TEXT,
                    deferred_reason TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'deferred',
                    deferred_at INTEGER NOT NULL,
                    enqueued_at INTEGER,
                    resolved_at INTEGER,
                    PRIMARY KEY (article_id, sequence)
                )
                "#,
                "CREATE INDEX idx_deferred_videos_status ON deferred_videos(status)",
                r#"
                CREATE TABLE failed_media_downloads (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                    media_type TEXT NOT NULL,
                    sequence INTEGER NOT NULL,
                    site_slug TEXT NOT NULL,
                    article_url TEXT NOT NULL,
                    source_url TEXT NOT NULL,
                    referrer TEXT,
                    caption TEXT,
                    failure_count INTEGER NOT NULL DEFAULT 1,
                    last_error TEXT NOT NULL,
                    last_error_type TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    first_failed_at INTEGER NOT NULL,
                    last_failed_at INTEGER NOT NULL,
                    resolved_at INTEGER,
                    UNIQUE(article_id, media_type, sequence)
                )
                "#,
                "CREATE INDEX idx_failed_media_status ON failed_media_downloads(status)",
            ],
        )
        .await
    }

    /// Migration v2: durable task queue
    async fn migrate_v2(conn: &mut SqliteConnection) -> Result<()> {
        Self::apply_migration(
            conn,
            2,
            &[
                r#"
                CREATE TABLE tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    kind TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    max_attempts INTEGER NOT NULL,
                    next_attempt_at INTEGER NOT NULL,
                    last_error TEXT,
                    last_error_type TEXT,
                    soft_limit_secs INTEGER NOT NULL,
                    hard_limit_secs INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    started_at INTEGER
                )
                "#,
                "CREATE INDEX idx_tasks_claim ON tasks(status, next_attempt_at, id)",
            ],
        )
        .await
    }

    /// Highest applied schema version
    pub async fn schema_version(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(DatabaseError::QueryFailed(format!("schema version: {e}"))))
    }

    /// Wait for open connections to finish and close the pool
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Pool shared by every table module
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
