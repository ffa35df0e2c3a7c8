//! Article metadata and stored asset rows.

use crate::error::DatabaseError;
use crate::types::{ArticleId, AssetKind, ParsedArticle, StoredAsset};
use crate::{Error, Result};
use std::collections::BTreeSet;

use super::{ArticleRow, AssetRow, Database, DeferredStatus, StorageLocation};

fn query_failed(context: &str, e: sqlx::Error) -> Error {
    Error::Database(DatabaseError::QueryFailed(format!("{}: {}", context, e)))
}

impl Database {
    /// Insert or update an article by URL
    ///
    /// Returns the article id and whether the row was created.
    pub async fn upsert_article(
        &self,
        site_slug: &str,
        url: &str,
        article: &ParsedArticle,
    ) -> Result<(ArticleId, bool)> {
        let now = chrono::Utc::now().timestamp();
        let category_id = article.category.as_ref().and_then(|c| c.id.as_deref());
        let category_name = article.category.as_ref().and_then(|c| c.name.as_deref());
        let tags = (!article.tags.is_empty()).then(|| article.tags.join(","));
        let publish_date = article.publish_date.map(|d| d.timestamp());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        let existing: Option<ArticleId> = sqlx::query_scalar("SELECT id FROM articles WHERE url = ?")
            .bind(url)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| query_failed("Failed to look up article", e))?;

        let (id, created) = match existing {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE articles SET
                        site_slug = ?, title = ?, description = ?, content = ?,
                        category_id = ?, category_name = ?, tags = ?, publish_date = ?,
                        updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(site_slug)
                .bind(&article.title)
                .bind(&article.description)
                .bind(&article.content)
                .bind(category_id)
                .bind(category_name)
                .bind(&tags)
                .bind(publish_date)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| query_failed("Failed to update article", e))?;
                (id, false)
            }
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO articles (
                        site_slug, url, title, description, content,
                        category_id, category_name, tags, publish_date,
                        created_at, updated_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(site_slug)
                .bind(url)
                .bind(&article.title)
                .bind(&article.description)
                .bind(&article.content)
                .bind(category_id)
                .bind(category_name)
                .bind(&tags)
                .bind(publish_date)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| query_failed("Failed to insert article", e))?;
                (ArticleId(result.last_insert_rowid()), true)
            }
        };

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to commit article", e))?;

        Ok((id, created))
    }

    /// Get an article by ID
    pub async fn get_article(&self, id: ArticleId) -> Result<Option<ArticleRow>> {
        sqlx::query_as::<_, ArticleRow>(
            r#"
            SELECT id, site_slug, url, title, description, content,
                   category_id, category_name, tags, publish_date,
                   created_at, updated_at
            FROM articles
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to get article", e))
    }

    /// URLs of every stored article of a site (the resume set)
    pub async fn article_urls(&self, site_slug: &str) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT url FROM articles WHERE site_slug = ?")
            .bind(site_slug)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_failed("Failed to list article URLs", e))
    }

    /// Record written assets and resolve the bookkeeping they satisfy
    ///
    /// Rows are upserted per `(kind, sequence)`; rows for sequences not in
    /// `stored` are kept, since retries and re-drives only carry the assets
    /// still missing. Deferred videos and pending failures with a matching
    /// sequence are marked resolved. Runs in one transaction.
    pub async fn persist_assets(
        &self,
        article_id: ArticleId,
        stored: &[StoredAsset],
        location: &StorageLocation,
    ) -> Result<()> {
        if stored.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        for asset in stored {
            let kind = asset.source.kind.as_str();
            let sequence = i64::from(asset.source.sequence);

            sqlx::query(
                r#"
                INSERT INTO article_assets (
                    article_id, kind, sequence, path, source_url, checksum, bytes, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(article_id, kind, sequence) DO UPDATE SET
                    path = excluded.path,
                    source_url = excluded.source_url,
                    checksum = excluded.checksum,
                    bytes = excluded.bytes
                "#,
            )
            .bind(article_id)
            .bind(kind)
            .bind(sequence)
            .bind(location.asset_reference(&asset.path))
            .bind(&asset.source.source_url)
            .bind(&asset.checksum)
            .bind(i64::try_from(asset.bytes_written).unwrap_or(i64::MAX))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| query_failed("Failed to insert asset row", e))?;

            if asset.source.kind == AssetKind::Video {
                sqlx::query(
                    r#"
                    UPDATE deferred_videos
                    SET status = ?, resolved_at = ?
                    WHERE article_id = ? AND sequence = ? AND status != ?
                    "#,
                )
                .bind(DeferredStatus::Resolved.as_str())
                .bind(now)
                .bind(article_id)
                .bind(sequence)
                .bind(DeferredStatus::Resolved.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| query_failed("Failed to resolve deferred video", e))?;
            }

            sqlx::query(
                r#"
                UPDATE failed_media_downloads
                SET status = 'resolved', resolved_at = ?
                WHERE article_id = ? AND media_type = ? AND sequence = ?
                  AND resolved_at IS NULL
                "#,
            )
            .bind(now)
            .bind(article_id)
            .bind(kind)
            .bind(sequence)
            .execute(&mut *tx)
            .await
            .map_err(|e| query_failed("Failed to resolve failed download", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to commit assets", e))?;

        tracing::debug!(article_id = %article_id, assets = stored.len(), "Assets persisted");
        Ok(())
    }

    /// Stored asset rows of an article, ordered by kind and sequence
    pub async fn list_assets(&self, article_id: ArticleId) -> Result<Vec<AssetRow>> {
        sqlx::query_as::<_, AssetRow>(
            r#"
            SELECT article_id, kind, sequence, path, source_url, checksum, bytes
            FROM article_assets
            WHERE article_id = ?
            ORDER BY kind, sequence
            "#,
        )
        .bind(article_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to list assets", e))
    }

    /// Sequences of `kind` already stored for an article
    pub async fn stored_sequences(&self, article_id: ArticleId, kind: AssetKind) -> Result<BTreeSet<u32>> {
        let rows: Vec<i64> = sqlx::query_scalar(
            "SELECT sequence FROM article_assets WHERE article_id = ? AND kind = ?",
        )
        .bind(article_id)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to list stored sequences", e))?;

        Ok(rows.into_iter().filter_map(|s| u32::try_from(s).ok()).collect())
    }
}
