//! Re-drive of deferred videos and failed downloads
//!
//! Collects pending bookkeeping rows, groups them by article and enqueues one
//! fresh download task per article. Deferred videos are only picked up once
//! their category passes the current video policy. Rows are never cleared
//! here: a deferral moves to `enqueued`, and both kinds of row are resolved by
//! [`Database::persist_assets`](crate::db::Database::persist_assets) once the
//! file is written.

use crate::context::AppContext;
use crate::db::MediaFilter;
use crate::orchestrator::TaskPayload;
use crate::sites::get_site;
use crate::types::{ArticleId, AssetKind, AssetRef};
use crate::Result;
use std::collections::{BTreeMap, BTreeSet};

/// What to re-drive
#[derive(Debug, Clone, Default)]
pub struct RedriveOptions {
    /// Pending failed downloads
    pub include_failed: bool,
    /// Deferred videos allowed by the current policy
    pub include_deferred: bool,
    /// Site, article and row limits
    pub filter: MediaFilter,
}

/// Totals of one re-drive pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RedriveStats {
    /// Articles that got a task
    pub articles: u64,
    /// Assets enqueued
    pub assets: u64,
    /// Rows whose asset is already stored
    pub skipped_stored: u64,
    /// Deferrals still blocked by the video policy
    pub skipped_policy: u64,
    /// Tasks enqueued
    pub enqueued_tasks: u64,
}

#[derive(Default)]
struct ArticleBatch {
    site: String,
    article_url: String,
    assets: BTreeMap<(AssetKind, u32), AssetRef>,
    deferred: BTreeSet<u32>,
}

impl ArticleBatch {
    fn add(&mut self, site: &str, article_url: &str, asset: AssetRef) {
        if self.site.is_empty() {
            self.site = site.to_string();
            self.article_url = article_url.to_string();
        }
        self.assets.entry((asset.kind, asset.sequence)).or_insert(asset);
    }
}

/// Enqueue downloads for pending bookkeeping rows
pub async fn redrive(ctx: &AppContext, options: &RedriveOptions) -> Result<RedriveStats> {
    let mut stats = RedriveStats::default();
    let mut batches: BTreeMap<ArticleId, ArticleBatch> = BTreeMap::new();

    if options.include_failed {
        for row in ctx.db.list_pending_failures(&options.filter).await? {
            batches
                .entry(row.article_id)
                .or_default()
                .add(&row.site_slug, &row.article_url, row.to_asset());
        }
    }

    if options.include_deferred {
        for row in ctx.db.list_deferred_videos(&options.filter).await? {
            if !ctx.config.video.allows(row.category_key.as_deref()) {
                stats.skipped_policy += 1;
                continue;
            }
            let asset = row.to_asset();
            let batch = batches.entry(row.article_id).or_default();
            batch.deferred.insert(asset.sequence);
            batch.add(&row.site_slug, &row.article_url, asset);
        }
    }

    if batches.is_empty() {
        tracing::info!(skipped_policy = stats.skipped_policy, "Nothing to re-drive");
        return Ok(stats);
    }

    let base = ctx.payload_config()?;
    for (article_id, batch) in batches {
        let stored_images = ctx.db.stored_sequences(article_id, AssetKind::Image).await?;
        let stored_videos = ctx.db.stored_sequences(article_id, AssetKind::Video).await?;

        let mut assets = Vec::with_capacity(batch.assets.len());
        for ((kind, sequence), asset) in batch.assets {
            let stored = match kind {
                AssetKind::Image => &stored_images,
                AssetKind::Video => &stored_videos,
            };
            if stored.contains(&sequence) {
                stats.skipped_stored += 1;
                continue;
            }
            assets.push(asset);
        }
        if assets.is_empty() {
            continue;
        }
        assets.sort_by_key(|a| a.sequence);

        let enqueued_deferred: Vec<u32> = assets
            .iter()
            .filter(|a| a.kind == AssetKind::Video && batch.deferred.contains(&a.sequence))
            .map(|a| a.sequence)
            .collect();

        let mut config = base.clone();
        if let Ok(site) = get_site(&batch.site) {
            config.user_agent = site.user_agent(&ctx.config).to_string();
        }

        let asset_count = assets.len();
        let payload = TaskPayload {
            article_id,
            db_url: ctx.db_url.clone(),
            article_url: batch.article_url,
            site: batch.site,
            assets,
            config,
            resolve: ctx.resolve_settings(),
        };
        let task_id = ctx.queue.enqueue(&payload).await?;

        if !enqueued_deferred.is_empty() {
            ctx.db.mark_deferred_enqueued(article_id, &enqueued_deferred).await?;
        }

        tracing::info!(
            article_id = %article_id,
            task_id,
            assets = asset_count,
            deferred = enqueued_deferred.len(),
            "Re-drive task enqueued"
        );
        stats.articles += 1;
        stats.assets += asset_count as u64;
        stats.enqueued_tasks += 1;
    }

    tracing::info!(
        articles = stats.articles,
        assets = stats.assets,
        skipped_stored = stats.skipped_stored,
        skipped_policy = stats.skipped_policy,
        "Re-drive finished"
    );
    Ok(stats)
}
