//! Deferred video and failed media bookkeeping.
//!
//! A deferred video waits for its category to be enabled; a failed download
//! waits for a re-drive. Both rows are only resolved by
//! [`Database::persist_assets`] after the file is on disk, and neither is
//! ever deleted.

use crate::error::DatabaseError;
use crate::types::ArticleId;
use crate::{Error, Result};

use super::{
    Database, DEFAULT_DEFERRED_REASON, DeferredStatus, DeferredVideo, FailedMediaDownload,
    MediaFilter, NewDeferredVideos, NewFailedMedia,
};

fn query_failed(context: &str, e: sqlx::Error) -> Error {
    Error::Database(DatabaseError::QueryFailed(format!("{}: {}", context, e)))
}

/// First non-empty candidate, trimmed and lowercased
pub fn category_key(
    category_id: Option<&str>,
    category_name: Option<&str>,
    ingest_category: Option<&str>,
) -> Option<String> {
    [category_id, category_name, ingest_category]
        .into_iter()
        .flatten()
        .map(|c| c.trim().to_lowercase())
        .find(|c| !c.is_empty())
}

impl Database {
    /// Upsert deferred videos keyed by `(article_id, sequence)`
    ///
    /// Re-saving a row refreshes it, sets it back to `deferred` and clears
    /// `enqueued_at`.
    pub async fn save_deferred_video_assets(&self, deferred: &NewDeferredVideos<'_>) -> Result<()> {
        if deferred.assets.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp();
        let key = category_key(
            deferred.category_id,
            deferred.category_name,
            deferred.ingest_category,
        );
        let reason = deferred.reason.unwrap_or(DEFAULT_DEFERRED_REASON);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        for asset in deferred.assets {
            let referrer = asset.referrer.as_deref().unwrap_or(deferred.article_url);
            sqlx::query(
                r#"
                INSERT INTO deferred_videos (
                    article_id, sequence, site_slug, article_url, source_url, referrer,
                    caption, category_id, category_name, category_key, ingest_category,
                    deferred_reason, status, deferred_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(article_id, sequence) DO UPDATE SET
                    site_slug = excluded.site_slug,
                    article_url = excluded.article_url,
                    source_url = excluded.source_url,
                    referrer = excluded.referrer,
                    caption = excluded.caption,
                    category_id = excluded.category_id,
                    category_name = excluded.category_name,
                    category_key = excluded.category_key,
                    ingest_category = excluded.ingest_category,
                    deferred_reason = excluded.deferred_reason,
                    status = excluded.status,
                    deferred_at = excluded.deferred_at,
                    enqueued_at = NULL,
                    resolved_at = NULL
                "#,
            )
            .bind(deferred.article_id)
            .bind(i64::from(asset.sequence))
            .bind(deferred.site_slug)
            .bind(deferred.article_url)
            .bind(&asset.source_url)
            .bind(referrer)
            .bind(&asset.caption)
            .bind(deferred.category_id)
            .bind(deferred.category_name)
            .bind(&key)
            .bind(deferred.ingest_category)
            .bind(reason)
            .bind(DeferredStatus::Deferred.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| query_failed("Failed to save deferred video", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to commit deferred videos", e))?;

        tracing::info!(
            article_id = %deferred.article_id,
            videos = deferred.assets.len(),
            reason,
            "Deferred video assets"
        );
        Ok(())
    }

    /// Upsert failure rows keyed by `(article_id, media_type, sequence)`
    ///
    /// An existing row gets `failure_count + 1`, the latest error, and goes
    /// back to `pending` even if it had been resolved.
    pub async fn record_failed_media_downloads(&self, failed: &NewFailedMedia<'_>) -> Result<()> {
        if failed.assets.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        for asset in failed.assets {
            let referrer = asset.referrer.as_deref().unwrap_or(failed.article_url);
            sqlx::query(
                r#"
                INSERT INTO failed_media_downloads (
                    article_id, media_type, sequence, site_slug, article_url, source_url,
                    referrer, caption, failure_count, last_error, last_error_type, status,
                    first_failed_at, last_failed_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, 'pending', ?, ?)
                ON CONFLICT(article_id, media_type, sequence) DO UPDATE SET
                    site_slug = excluded.site_slug,
                    article_url = excluded.article_url,
                    source_url = excluded.source_url,
                    referrer = excluded.referrer,
                    caption = excluded.caption,
                    failure_count = failed_media_downloads.failure_count + 1,
                    last_error = excluded.last_error,
                    last_error_type = excluded.last_error_type,
                    status = 'pending',
                    last_failed_at = excluded.last_failed_at,
                    resolved_at = NULL
                "#,
            )
            .bind(failed.article_id)
            .bind(asset.kind.as_str())
            .bind(i64::from(asset.sequence))
            .bind(failed.site_slug)
            .bind(failed.article_url)
            .bind(&asset.source_url)
            .bind(referrer)
            .bind(&asset.caption)
            .bind(failed.error)
            .bind(failed.error_type)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| query_failed("Failed to record failed download", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to commit failed downloads", e))?;

        tracing::warn!(
            article_id = %failed.article_id,
            assets = failed.assets.len(),
            error = %failed.error,
            "Recorded failed media downloads"
        );
        Ok(())
    }

    /// Deferred videos still waiting, oldest first
    pub async fn list_deferred_videos(&self, filter: &MediaFilter) -> Result<Vec<DeferredVideo>> {
        sqlx::query_as::<_, DeferredVideo>(
            r#"
            SELECT article_id, sequence, site_slug, article_url, source_url, referrer,
                   caption, category_key, category_name, deferred_reason, status,
                   deferred_at, enqueued_at, resolved_at
            FROM deferred_videos
            WHERE status = 'deferred'
              AND (? IS NULL OR site_slug = ?)
              AND (? IS NULL OR article_id = ?)
            ORDER BY deferred_at, article_id, sequence
            LIMIT ?
            "#,
        )
        .bind(&filter.site_slug)
        .bind(&filter.site_slug)
        .bind(filter.article_id)
        .bind(filter.article_id)
        .bind(filter.limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to list deferred videos", e))
    }

    /// Deferred video row by key, whatever its status
    pub async fn get_deferred_video(&self, article_id: ArticleId, sequence: u32) -> Result<Option<DeferredVideo>> {
        sqlx::query_as::<_, DeferredVideo>(
            r#"
            SELECT article_id, sequence, site_slug, article_url, source_url, referrer,
                   caption, category_key, category_name, deferred_reason, status,
                   deferred_at, enqueued_at, resolved_at
            FROM deferred_videos
            WHERE article_id = ? AND sequence = ?
            "#,
        )
        .bind(article_id)
        .bind(i64::from(sequence))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to get deferred video", e))
    }

    /// Pending failures, oldest failure first
    pub async fn list_pending_failures(&self, filter: &MediaFilter) -> Result<Vec<FailedMediaDownload>> {
        sqlx::query_as::<_, FailedMediaDownload>(
            r#"
            SELECT article_id, media_type, sequence, site_slug, article_url, source_url,
                   referrer, caption, failure_count, last_error, last_error_type, status,
                   first_failed_at, last_failed_at, resolved_at
            FROM failed_media_downloads
            WHERE status = 'pending'
              AND (? IS NULL OR site_slug = ?)
              AND (? IS NULL OR article_id = ?)
            ORDER BY last_failed_at, article_id, media_type, sequence
            LIMIT ?
            "#,
        )
        .bind(&filter.site_slug)
        .bind(&filter.site_slug)
        .bind(filter.article_id)
        .bind(filter.article_id)
        .bind(filter.limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to list pending failures", e))
    }

    /// All failure rows of an article, whatever their status
    pub async fn failures_for_article(&self, article_id: ArticleId) -> Result<Vec<FailedMediaDownload>> {
        sqlx::query_as::<_, FailedMediaDownload>(
            r#"
            SELECT article_id, media_type, sequence, site_slug, article_url, source_url,
                   referrer, caption, failure_count, last_error, last_error_type, status,
                   first_failed_at, last_failed_at, resolved_at
            FROM failed_media_downloads
            WHERE article_id = ?
            ORDER BY media_type, sequence
            "#,
        )
        .bind(article_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to list article failures", e))
    }

    /// Mark deferred videos as handed to the task queue
    pub async fn mark_deferred_enqueued(&self, article_id: ArticleId, sequences: &[u32]) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let mut updated = 0;
        for sequence in sequences {
            let result = sqlx::query(
                r#"
                UPDATE deferred_videos
                SET status = ?, enqueued_at = ?
                WHERE article_id = ? AND sequence = ? AND status = ?
                "#,
            )
            .bind(DeferredStatus::Enqueued.as_str())
            .bind(now)
            .bind(article_id)
            .bind(i64::from(*sequence))
            .bind(DeferredStatus::Deferred.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| query_failed("Failed to mark deferred video enqueued", e))?;
            updated += result.rows_affected();
        }
        Ok(updated)
    }
}
