//! Task worker: claim loops, time limits and failure dispatch
//!
//! A [`Worker`] runs `worker.concurrency` claim loops. For every claimed
//! task it:
//!
//! 1. checks the storage breaker for the payload's volume and, if tripped,
//!    returns the task unstarted and stops every loop
//! 2. runs the unit under its soft limit (cooperative: assets not yet
//!    started are cancelled) and hard limit (the unit is dropped, which
//!    kills any transcoder, and the task is redelivered)
//! 3. completes, retries (transient failure with attempts left) or fails
//!    the task; a failed task records every unstored asset in the failed
//!    media bookkeeping
//! 4. checks the breaker again
//!
//! Units already running in other loops finish before `run` returns.

use super::payload::{DOWNLOAD_ASSETS, RESOLVE_VIDEOS, TaskPayload};
use super::resolver::{CommandVideoResolver, VideoResolver, apply_streams};
use crate::context::AppContext;
use crate::db::{NewFailedMedia, TaskRecord, TaskStatus};
use crate::error::ErrorKind;
use crate::retry::retry_delay;
use crate::types::{AssetKind, AssetRef};
use crate::{Error, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Counters of one `run`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Tasks completed
    pub succeeded: u64,
    /// Tasks given up on
    pub failed: u64,
    /// Tasks rescheduled after a transient failure
    pub retried: u64,
    /// Tasks returned to the queue after the hard limit
    pub redelivered: u64,
    /// Whether the storage breaker stopped the worker
    pub paused: bool,
}

#[derive(Default)]
struct Counters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    redelivered: AtomicU64,
    paused: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Succeeded,
    Retried,
    Failed,
    Redelivered,
    Unclaimed,
}

/// An asset the unit did not store, with why
struct Unstored {
    asset: AssetRef,
    reason: String,
    kind: ErrorKind,
}

struct UnitFailure {
    error: Error,
    unstored: Vec<Unstored>,
}

impl UnitFailure {
    /// Failure that leaves every asset in `assets` unstored for the same reason
    fn whole(error: Error, assets: &[AssetRef]) -> Self {
        let reason = error.to_string();
        let kind = error.kind();
        Self {
            unstored: assets
                .iter()
                .map(|asset| Unstored {
                    asset: asset.clone(),
                    reason: reason.clone(),
                    kind,
                })
                .collect(),
            error,
        }
    }
}

/// Consumer side of the task queue
#[derive(Clone)]
pub struct Worker {
    ctx: Arc<AppContext>,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
}

impl Worker {
    /// Worker using the collaborators in `ctx`
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            shutdown: CancellationToken::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Cancel to stop claiming; running units finish first
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            redelivered: self.counters.redelivered.load(Ordering::Relaxed),
            paused: self.counters.paused.load(Ordering::Relaxed),
        }
    }

    /// Process tasks until shut down or the storage breaker trips
    pub async fn run(&self) -> Result<WorkerStats> {
        self.run_loops(false).await
    }

    /// Process tasks until none is due, then return
    pub async fn run_until_idle(&self) -> Result<WorkerStats> {
        self.run_loops(true).await
    }

    async fn run_loops(&self, drain: bool) -> Result<WorkerStats> {
        self.recover_stale_tasks().await?;

        let concurrency = self.ctx.config.worker.concurrency.max(1);
        let queued = self.ctx.db.count_tasks(TaskStatus::Queued).await?;
        tracing::info!(concurrency, drain, queued, "Worker started");

        let mut loops = JoinSet::new();
        for slot in 0..concurrency {
            let worker = self.clone();
            loops.spawn(async move { worker.claim_loop(slot, drain).await });
        }
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker loop panicked");
            }
        }

        let stats = self.stats();
        tracing::info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            retried = stats.retried,
            redelivered = stats.redelivered,
            paused = stats.paused,
            "Worker stopped"
        );
        Ok(stats)
    }

    /// Requeue tasks of a dead worker, or fail them once out of retries
    async fn recover_stale_tasks(&self) -> Result<()> {
        let stale = self.ctx.db.requeue_stale_tasks().await?;
        for task in stale.failed {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            let payload = match TaskPayload::from_json(&task.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(task_id = task.id, error = %e, "Unreadable payload on abandoned task");
                    continue;
                }
            };
            let reason = "worker lost".to_string();
            let unstored: Vec<Unstored> = self
                .unstored_or_all(task.id, &payload)
                .await
                .into_iter()
                .map(|asset| Unstored {
                    asset,
                    reason: reason.clone(),
                    kind: ErrorKind::Transient,
                })
                .collect();
            self.record_unstored(task.id, &payload, &unstored).await;
        }
        Ok(())
    }

    async fn claim_loop(&self, slot: usize, drain: bool) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let task = match self.ctx.db.claim_next_task().await {
                Ok(task) => task,
                Err(e) => {
                    tracing::warn!(slot, error = %e, "Failed to claim task");
                    None
                }
            };

            let Some(task) = task else {
                if drain {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.idle_wait().await) => {}
                    _ = self.shutdown.cancelled() => {}
                }
                continue;
            };

            let disposition = self.execute(task).await;
            let counter = match disposition {
                Disposition::Succeeded => &self.counters.succeeded,
                Disposition::Retried => &self.counters.retried,
                Disposition::Failed => &self.counters.failed,
                Disposition::Redelivered => &self.counters.redelivered,
                Disposition::Unclaimed => continue,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(slot, "Claim loop finished");
    }

    /// Sleep until the next retry is due, at most one poll interval
    async fn idle_wait(&self) -> Duration {
        let poll = self.ctx.config.worker.poll_interval;
        match self.ctx.db.next_due_in().await {
            Ok(Some(due)) => due.clamp(Duration::from_millis(50), poll.max(Duration::from_millis(50))),
            Ok(None) => poll,
            Err(e) => {
                tracing::debug!(error = %e, "Cannot read next due task");
                poll
            }
        }
    }

    fn trip_breaker(&self) {
        self.counters.paused.store(true, Ordering::Relaxed);
        self.shutdown.cancel();
    }

    async fn execute(&self, task: TaskRecord) -> Disposition {
        let payload = match TaskPayload::from_json(&task.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(task_id = task.id, error = %e, "Unreadable task payload");
                log_db(
                    self.ctx.db.fail_task(task.id, &e.to_string(), e.kind().as_str()).await,
                    task.id,
                );
                return Disposition::Failed;
            }
        };
        if payload.db_url != self.ctx.db_url {
            tracing::warn!(
                task_id = task.id,
                payload_db = %payload.db_url,
                worker_db = %self.ctx.db_url,
                "Task payload names a different database; using the worker's"
            );
        }

        let monitor = self.ctx.storage_for(&payload.config);
        let tripped = match monitor.check_and_maybe_pause().await {
            Ok(tripped) => tripped,
            Err(e) => {
                tracing::error!(task_id = task.id, error = %e, "Storage check failed; stopping worker");
                true
            }
        };
        if tripped {
            tracing::warn!(
                task_id = task.id,
                article_id = %payload.article_id,
                pause_file = %monitor.pause_file().display(),
                "Storage paused before task start; returning task to the queue"
            );
            log_db(self.ctx.db.unclaim_task(task.id).await, task.id);
            self.trip_breaker();
            return Disposition::Unclaimed;
        }

        tracing::info!(
            task_id = task.id,
            kind = %task.kind,
            attempt = task.attempts,
            article_id = %payload.article_id,
            assets = payload.assets.len(),
            "Task started"
        );

        let soft_limit = Duration::from_secs(u64::try_from(task.soft_limit_secs).unwrap_or(0));
        let hard_limit = Duration::from_secs(u64::try_from(task.hard_limit_secs).unwrap_or(0)).max(soft_limit);
        let cancel = CancellationToken::new();

        // The unit is dropped at the end of this block, killing any transcoder
        // before the hard-limit cleanup touches its files
        let result = {
            let unit = self.run_unit(&task, &payload, &cancel);
            tokio::pin!(unit);
            tokio::select! {
                result = &mut unit => Some(result),
                _ = tokio::time::sleep(soft_limit) => {
                    tracing::warn!(
                        task_id = task.id,
                        soft_limit_secs = soft_limit.as_secs(),
                        "Soft time limit reached; cancelling assets not yet started"
                    );
                    cancel.cancel();
                    tokio::time::timeout(hard_limit.saturating_sub(soft_limit), &mut unit).await.ok()
                }
            }
        };

        let disposition = match result {
            Some(Ok(())) => {
                tracing::info!(task_id = task.id, article_id = %payload.article_id, "Task succeeded");
                log_db(self.ctx.db.complete_task(task.id).await, task.id);
                Disposition::Succeeded
            }
            Some(Err(failure)) => self.handle_failure(&task, &payload, failure).await,
            None => self.handle_hard_limit(&task, &payload, hard_limit).await,
        };

        match monitor.check_and_maybe_pause().await {
            Ok(false) => {}
            Ok(true) => {
                tracing::warn!(task_id = task.id, "Storage threshold reached after task; stopping worker");
                self.trip_breaker();
            }
            Err(e) => {
                tracing::error!(task_id = task.id, error = %e, "Storage check failed; stopping worker");
                self.trip_breaker();
            }
        }
        disposition
    }

    async fn run_unit(
        &self,
        task: &TaskRecord,
        payload: &TaskPayload,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), UnitFailure> {
        match task.kind.as_str() {
            RESOLVE_VIDEOS => self
                .resolve_stage(payload)
                .await
                .map_err(|e| UnitFailure::whole(e, &[])),
            DOWNLOAD_ASSETS => self.download_stage(task, payload, cancel).await,
            other => Err(UnitFailure::whole(
                Error::NotSupported(format!("unknown task kind '{other}'")),
                &[],
            )),
        }
    }

    /// Swap video URLs for resolved streams, then enqueue the download
    ///
    /// A failing resolver only costs the swap: the download is enqueued with
    /// the original URLs.
    async fn resolve_stage(&self, payload: &TaskPayload) -> Result<()> {
        let mut next = payload.clone();
        next.resolve = None;

        let resolver: Option<Arc<dyn VideoResolver>> = match (&self.ctx.resolver, &payload.resolve) {
            (Some(resolver), _) => Some(Arc::clone(resolver)),
            (None, Some(settings)) => {
                CommandVideoResolver::new(&settings.command, Duration::from_secs(settings.timeout))
                    .map(|r| Arc::new(r) as Arc<dyn VideoResolver>)
                    .map_err(|e| tracing::warn!(error = %e, "Invalid resolver command in payload"))
                    .ok()
            }
            (None, None) => None,
        };

        if let Some(resolver) = resolver {
            match resolver.resolve_streams(&payload.article_url).await {
                Ok(streams) if streams.is_empty() => {
                    tracing::debug!(article_id = %payload.article_id, "Resolver found no streams");
                }
                Ok(streams) => {
                    let (assets, changed) = apply_streams(next.assets, streams, &payload.article_url);
                    next.assets = assets;
                    tracing::info!(article_id = %payload.article_id, changed, "Video streams resolved");
                }
                Err(e) => {
                    tracing::warn!(
                        article_id = %payload.article_id,
                        error = %e,
                        "Video resolution failed; downloading original URLs"
                    );
                }
            }
        }

        self.ctx.queue.enqueue(&next).await?;
        Ok(())
    }

    async fn download_stage(
        &self,
        task: &TaskRecord,
        payload: &TaskPayload,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), UnitFailure> {
        let article_id = payload.article_id;

        // A retry only fetches what earlier attempts did not store
        let pending = if task.attempts > 1 {
            self.unstored_assets(payload)
                .await
                .map_err(|e| UnitFailure::whole(e, &payload.assets))?
        } else {
            payload.assets.clone()
        };
        if pending.is_empty() {
            tracing::info!(article_id = %article_id, "No assets left to download");
            return Ok(());
        }

        let manager = self
            .ctx
            .asset_manager(&payload.config)
            .map_err(|e| UnitFailure::whole(e, &pending))?;
        let batch = manager.download_each_until(article_id, pending.clone(), cancel).await;

        if !batch.stored.is_empty() {
            self.ctx
                .db
                .persist_assets(article_id, &batch.stored, &payload.config.storage_location())
                .await
                .map_err(|e| UnitFailure::whole(e, &pending))?;
        }

        if batch.failed.is_empty() {
            tracing::info!(
                article_id = %article_id,
                stored = batch.stored.len(),
                blocked = batch.blocked.len(),
                "Assets downloaded"
            );
            return Ok(());
        }

        // A transient failure decides the task's fate: retrying can still help
        let lead = batch
            .failed
            .iter()
            .position(|(_, e)| e.kind() == ErrorKind::Transient)
            .unwrap_or(0);
        let mut unstored = Vec::with_capacity(batch.failed.len());
        let mut error = None;
        for (index, (asset, e)) in batch.failed.into_iter().enumerate() {
            unstored.push(Unstored {
                reason: e.to_string(),
                kind: e.kind(),
                asset: asset.clone(),
            });
            if index == lead {
                error = Some(Error::Download(e.for_asset(asset.kind, asset.sequence)));
            }
        }
        let error = error.unwrap_or_else(|| Error::Other("asset download failed".to_string()));
        Err(UnitFailure { error, unstored })
    }

    /// Payload assets without a stored row
    async fn unstored_assets(&self, payload: &TaskPayload) -> Result<Vec<AssetRef>> {
        let images = self.ctx.db.stored_sequences(payload.article_id, AssetKind::Image).await?;
        let videos = self.ctx.db.stored_sequences(payload.article_id, AssetKind::Video).await?;
        Ok(payload
            .assets
            .iter()
            .filter(|a| {
                let stored: &BTreeSet<u32> = match a.kind {
                    AssetKind::Image => &images,
                    AssetKind::Video => &videos,
                };
                !stored.contains(&a.sequence)
            })
            .cloned()
            .collect())
    }

    /// [`Self::unstored_assets`], or every payload asset when that lookup fails
    async fn unstored_or_all(&self, task_id: i64, payload: &TaskPayload) -> Vec<AssetRef> {
        match self.unstored_assets(payload).await {
            Ok(assets) => assets,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "Cannot list stored assets");
                payload.assets.clone()
            }
        }
    }

    async fn handle_failure(&self, task: &TaskRecord, payload: &TaskPayload, failure: UnitFailure) -> Disposition {
        let kind = failure.error.kind();
        let message = failure.error.to_string();

        if kind == ErrorKind::Transient && task.can_retry() {
            let retry = u32::try_from(task.attempts).unwrap_or(u32::MAX);
            let delay = retry_delay(&self.ctx.config.worker.retry, retry);
            tracing::warn!(
                task_id = task.id,
                attempt = task.attempts,
                max_attempts = task.max_attempts,
                delay_secs = delay.as_secs(),
                error = %message,
                "Task failed; retrying"
            );
            log_db(
                self.ctx.db.retry_task(task.id, delay, &message, kind.as_str()).await,
                task.id,
            );
            return Disposition::Retried;
        }

        tracing::error!(
            task_id = task.id,
            attempt = task.attempts,
            kind = %kind,
            error = %message,
            unstored = failure.unstored.len(),
            "Task failed"
        );
        log_db(self.ctx.db.fail_task(task.id, &message, kind.as_str()).await, task.id);
        self.record_unstored(task.id, payload, &failure.unstored).await;
        Disposition::Failed
    }

    async fn handle_hard_limit(&self, task: &TaskRecord, payload: &TaskPayload, hard_limit: Duration) -> Disposition {
        let message = format!("hard time limit of {}s exceeded", hard_limit.as_secs());
        tracing::error!(task_id = task.id, article_id = %payload.article_id, "Task killed: {message}");

        match self.ctx.asset_manager(&payload.config) {
            Ok(manager) => {
                if let Err(e) = manager.remove_partials(payload.article_id).await {
                    tracing::warn!(article_id = %payload.article_id, error = %e, "Failed to remove partial files");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Cannot build asset manager for cleanup"),
        }

        if task.can_retry() {
            log_db(self.ctx.db.release_task(task.id, &message).await, task.id);
            return Disposition::Redelivered;
        }

        log_db(
            self.ctx
                .db
                .fail_task(task.id, &message, ErrorKind::Transient.as_str())
                .await,
            task.id,
        );
        let unstored: Vec<Unstored> = self
            .unstored_or_all(task.id, payload)
            .await
            .into_iter()
            .map(|asset| Unstored {
                asset,
                reason: message.clone(),
                kind: ErrorKind::Transient,
            })
            .collect();
        self.record_unstored(task.id, payload, &unstored).await;
        Disposition::Failed
    }

    async fn record_unstored(&self, task_id: i64, payload: &TaskPayload, unstored: &[Unstored]) {
        for item in unstored {
            let result = self
                .ctx
                .db
                .record_failed_media_downloads(&NewFailedMedia {
                    article_id: payload.article_id,
                    site_slug: &payload.site,
                    article_url: &payload.article_url,
                    assets: std::slice::from_ref(&item.asset),
                    error: &item.reason,
                    error_type: Some(item.kind.as_str()),
                })
                .await;
            log_db(result, task_id);
        }
    }
}

fn log_db(result: Result<()>, task_id: i64) {
    if let Err(e) = result {
        tracing::error!(task_id, error = %e, "Failed to update task bookkeeping");
    }
}
