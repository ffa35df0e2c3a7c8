//! Crawl loop: frontier jobs in, articles and download tasks out
//!
//! [`IngestRunner::run`] drains a frontier source through a bounded pool of
//! fetch+parse tasks. Each job becomes an article row plus at most one
//! download task; videos whose category is not enabled are parked in the
//! deferred bookkeeping instead. The storage breaker is consulted before
//! every job is scheduled, and a pause stops scheduling while jobs already
//! running finish.

use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::context::AppContext;
use crate::db::{NewDeferredVideos, category_key};
use crate::frontier::{self, EmitPolicy, FrontierSource, NdjsonJobWriter, PageFetcher};
use crate::orchestrator::{PayloadConfig, TaskPayload};
use crate::sites::{ArticleParser, SiteDefinition};
use crate::types::{ArticleId, AssetKind, AssetRef, CrawlJob, FrontierStats};
use crate::utils::build_http_client;
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// File name of the per-job failure log inside `ingest.log_dir`
pub const FETCH_FAILURE_LOG: &str = "fetch_failures.ndjson";

/// Totals of one crawl
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Jobs scheduled
    pub processed: u64,
    /// Jobs that produced an article
    pub succeeded: u64,
    /// Jobs that failed to fetch, parse or persist
    pub failed: u64,
    /// Candidates the frontier did not emit
    pub skipped: u64,
    /// Frontier counters
    pub frontier: FrontierStats,
    /// Whether the storage breaker stopped scheduling
    pub paused: bool,
}

impl IngestStats {
    /// Process exit code: 1 if any job failed
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 { 1 } else { 0 }
    }
}

/// One line of `fetch_failures.ndjson`
#[derive(Debug, Serialize)]
struct FetchFailure<'a> {
    url: &'a str,
    lastmod: Option<&'a str>,
    sitemap_url: Option<&'a str>,
    image_url: Option<&'a str>,
    error: String,
    error_type: &'static str,
    timestamp: String,
}

/// What a successful job produced
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobOutcome {
    /// Article row
    pub article_id: ArticleId,
    /// Whether the row was created by this job
    pub created: bool,
    /// Download task, when any asset was left to fetch
    pub task_id: Option<i64>,
    /// Videos parked until their category is enabled
    pub deferred: usize,
    /// Assets dropped by the blacklist
    pub blocked: usize,
}

/// Crawl loop for one site
#[derive(Clone)]
pub struct IngestRunner {
    ctx: Arc<AppContext>,
    site: &'static SiteDefinition,
    parser: Arc<dyn ArticleParser>,
    fetcher: PageFetcher,
    payload: PayloadConfig,
    max_workers: usize,
    job_log: Option<PathBuf>,
}

impl IngestRunner {
    /// Runner using the site's parser and user agent
    pub fn new(ctx: Arc<AppContext>, site: &'static SiteDefinition) -> Result<Self> {
        let config = &ctx.config;
        let user_agent = site.user_agent(config).to_string();
        let client = build_http_client(&user_agent, config.frontier.request_timeout, config.proxy.as_ref())?;
        let fetcher = PageFetcher::new(client, config.frontier.fetch_retry.clone());

        let mut payload = ctx.payload_config()?;
        payload.user_agent = user_agent;

        Ok(Self {
            parser: site.parser(),
            max_workers: config.ingest.max_workers.max(1),
            ctx,
            site,
            fetcher,
            payload,
            job_log: None,
        })
    }

    /// Replace the site's parser
    pub fn with_parser(mut self, parser: Arc<dyn ArticleParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Override `ingest.max_workers`
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Append every scheduled job to an NDJSON log
    pub fn with_job_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.job_log = Some(path.into());
        self
    }

    /// Crawl everything `source` emits
    pub async fn run<S>(&self, source: S) -> Result<IngestStats>
    where
        S: FrontierSource + 'static,
    {
        let config = &self.ctx.config;
        let monitor = &self.ctx.storage;
        let mut stats = IngestStats::default();

        if monitor.check_and_maybe_pause().await? {
            tracing::warn!(
                site = self.site.slug,
                pause_file = %monitor.pause_file().display(),
                "Storage paused; not starting ingestion"
            );
            stats.paused = true;
            return Ok(stats);
        }

        let mut policy = if config.frontier.resume {
            let existing = self.ctx.db.article_urls(self.site.slug).await?;
            tracing::info!(site = self.site.slug, existing = existing.len(), "Resuming crawl");
            EmitPolicy::resume_from(existing)
        } else {
            EmitPolicy::default()
        };
        // Recorded per job after persistence, so jobs left in the channel by a
        // pause are offered again on the next run
        let checkpoint = self.ctx.checkpoint().await?;
        policy = policy.with_checkpoint(Arc::clone(&checkpoint)).with_deferred_commit();

        let failure_log = Arc::new(NdjsonJobWriter::open(config.ingest.log_dir.join(FETCH_FAILURE_LOG)).await?);
        let job_log = match &self.job_log {
            Some(path) => Some(NdjsonJobWriter::open(path).await?),
            None => None,
        };

        let mut handle = frontier::spawn(source, policy, config.frontier.channel_capacity);
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut running: JoinSet<bool> = JoinSet::new();

        loop {
            match monitor.check_and_maybe_pause().await {
                Ok(false) => {}
                Ok(true) => {
                    tracing::warn!(site = self.site.slug, "Storage threshold reached; no further jobs scheduled");
                    stats.paused = true;
                    break;
                }
                Err(e) => {
                    tracing::error!(site = self.site.slug, error = %e, "Storage check failed; no further jobs scheduled");
                    stats.paused = true;
                    break;
                }
            }
            let Some(job) = handle.recv().await else {
                break;
            };

            if let Some(log) = &job_log
                && let Err(e) = log.append(&job).await
            {
                tracing::warn!(url = %job.url, error = %e, "Failed to append job log");
            }

            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|_| Error::ShuttingDown)?;
            while let Some(done) = running.try_join_next() {
                tally(&mut stats, done);
            }

            stats.processed += 1;
            let runner = self.clone();
            let failure_log = Arc::clone(&failure_log);
            let checkpoint = Arc::clone(&checkpoint);
            running.spawn(async move {
                let _permit = permit;
                runner.handle_job(&job, &failure_log, &checkpoint).await
            });
        }

        while let Some(done) = running.join_next().await {
            tally(&mut stats, done);
        }

        let outcome = handle.finish().await?;
        let frontier = outcome.stats;
        stats.frontier = frontier;
        stats.skipped = frontier.skipped_existing + frontier.skipped_duplicate + frontier.skipped_invalid;

        tracing::info!(
            site = self.site.slug,
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            paused = stats.paused,
            "Ingestion finished"
        );
        Ok(stats)
    }

    async fn handle_job(&self, job: &CrawlJob, failure_log: &NdjsonJobWriter, checkpoint: &CheckpointStore) -> bool {
        match self.process_job(job).await {
            Ok(outcome) => {
                if let Err(e) = checkpoint.upsert(&CheckpointRecord::from(job)).await {
                    tracing::warn!(url = %job.url, error = %e, "Failed to checkpoint ingested article");
                }
                tracing::info!(
                    url = %job.url,
                    article_id = %outcome.article_id,
                    created = outcome.created,
                    task_id = ?outcome.task_id,
                    deferred = outcome.deferred,
                    "Article ingested"
                );
                true
            }
            Err(e) => {
                tracing::error!(url = %job.url, kind = %e.kind(), error = %e, "Failed to process article");
                let record = FetchFailure {
                    url: &job.url,
                    lastmod: job.lastmod.as_deref(),
                    sitemap_url: job.source_locator.as_deref(),
                    image_url: job.image_hint.as_deref(),
                    error: e.to_string(),
                    error_type: e.kind().as_str(),
                    timestamp: Utc::now().to_rfc3339(),
                };
                if let Err(log_error) = failure_log.append(&record).await {
                    tracing::warn!(url = %job.url, error = %log_error, "Failed to record fetch failure");
                }
                false
            }
        }
    }

    /// Fetch, parse and persist one job, then queue its downloads
    pub async fn process_job(&self, job: &CrawlJob) -> Result<JobOutcome> {
        let html = self.fetcher.get_text(&job.url).await?;
        let mut parsed = self.parser.parse(&job.url, &html)?;
        for asset in &mut parsed.assets {
            asset.referrer.get_or_insert_with(|| job.url.clone());
        }

        let (article_id, created) = self.ctx.db.upsert_article(self.site.slug, &job.url, &parsed).await?;

        if self.ctx.config.ingest.raw_html_cache {
            self.cache_raw_html(article_id, &html).await?;
        }

        let (blocked, assets): (Vec<AssetRef>, Vec<AssetRef>) = std::mem::take(&mut parsed.assets)
            .into_iter()
            .partition(|a| self.ctx.blacklist.is_blocked(&a.source_url));
        if !blocked.is_empty() {
            tracing::debug!(article_id = %article_id, blocked = blocked.len(), "Dropped blacklisted assets");
        }

        let category_id = parsed.category.as_ref().and_then(|c| c.id.as_deref());
        let category_name = parsed.category.as_ref().and_then(|c| c.name.as_deref());
        let key = category_key(category_id, category_name, job.category.as_deref());
        let videos_allowed = self.ctx.config.video.allows(key.as_deref());

        let (deferred, assets): (Vec<AssetRef>, Vec<AssetRef>) = assets
            .into_iter()
            .partition(|a| a.kind == AssetKind::Video && !videos_allowed);
        if !deferred.is_empty() {
            self.ctx
                .db
                .save_deferred_video_assets(&NewDeferredVideos {
                    article_id,
                    site_slug: self.site.slug,
                    article_url: &job.url,
                    category_id,
                    category_name,
                    ingest_category: job.category.as_deref(),
                    assets: &deferred,
                    reason: None,
                })
                .await?;
        }

        let task_id = if assets.is_empty() {
            None
        } else {
            let payload = TaskPayload {
                article_id,
                db_url: self.ctx.db_url.clone(),
                article_url: job.url.clone(),
                site: self.site.slug.to_string(),
                assets,
                config: self.payload.clone(),
                resolve: self.ctx.resolve_settings(),
            };
            Some(self.ctx.queue.enqueue(&payload).await?)
        };

        Ok(JobOutcome {
            article_id,
            created,
            task_id,
            deferred: deferred.len(),
            blocked: blocked.len(),
        })
    }

    async fn cache_raw_html(&self, article_id: ArticleId, html: &str) -> Result<()> {
        let dir = self
            .payload
            .storage_root
            .join("articles")
            .join(article_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("raw.html"), html).await?;
        Ok(())
    }
}

fn tally(stats: &mut IngestStats, done: std::result::Result<bool, tokio::task::JoinError>) {
    match done {
        Ok(true) => stats.succeeded += 1,
        Ok(false) => stats.failed += 1,
        Err(e) => {
            tracing::error!(error = %e, "Ingest task panicked");
            stats.failed += 1;
        }
    }
}
