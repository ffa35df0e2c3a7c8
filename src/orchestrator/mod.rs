//! Task orchestrator
//!
//! Asset work leaves the crawl loop as durable tasks in the `tasks` table and
//! is picked up by [`Worker`]s, possibly in other processes. Each task holds a
//! self-contained [`TaskPayload`]. Workers check the storage circuit breaker
//! before and after every unit, enforce soft and hard time limits, and retry
//! transient failures with exponential backoff recorded on the task itself.
//!
//! ## Submodules
//!
//! - [`payload`] - task payload wire format
//! - [`storage`] - capacity monitor and pause sentinel
//! - [`notify`] - operator notifications
//! - [`resolver`] - optional video stream resolution
//! - [`worker`] - claim loops and per-task dispatch

use crate::config::Config;
use crate::db::{Database, NewTask};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;

pub mod notify;
pub mod payload;
pub mod resolver;
pub mod storage;
pub mod worker;

pub use notify::{StorageNotifier, TelegramNotifier, ThresholdAlert, notifier_from_config};
pub use payload::{DOWNLOAD_ASSETS, PayloadConfig, RESOLVE_VIDEOS, ResolveSettings, TaskPayload};
pub use resolver::{CommandVideoResolver, ResolvedStream, VideoResolver, apply_streams};
pub use storage::{FixedUsage, StatvfsProbe, StorageMonitor, UsageProbe};
pub use worker::{Worker, WorkerStats};

/// Producer side of the task queue
#[derive(Clone)]
pub struct TaskQueue {
    db: Arc<Database>,
    max_attempts: u32,
    soft_limit: Duration,
    hard_limit: Duration,
}

impl TaskQueue {
    /// Queue with the retry budget and time limits of `config`
    pub fn new(db: Arc<Database>, config: &Config) -> Self {
        Self {
            db,
            max_attempts: config.worker.retry.max_attempts,
            soft_limit: config.soft_time_limit(),
            hard_limit: config.hard_time_limit(),
        }
    }

    /// Override the time limits stamped on new tasks
    pub fn with_limits(mut self, soft_limit: Duration, hard_limit: Duration) -> Self {
        self.soft_limit = soft_limit;
        self.hard_limit = hard_limit.max(soft_limit);
        self
    }

    /// Soft limit stamped on new tasks
    pub fn soft_limit(&self) -> Duration {
        self.soft_limit
    }

    /// Hard limit stamped on new tasks
    pub fn hard_limit(&self) -> Duration {
        self.hard_limit
    }

    /// Enqueue a payload under the kind it needs
    ///
    /// Payloads with a resolve stage and at least one video go through
    /// [`RESOLVE_VIDEOS`] first.
    pub async fn enqueue(&self, payload: &TaskPayload) -> Result<i64> {
        let kind = payload.task_kind();
        let id = self
            .db
            .enqueue_task(&NewTask {
                kind: kind.to_string(),
                payload: payload.to_json()?,
                max_attempts: self.max_attempts,
                soft_limit_secs: whole_secs(self.soft_limit),
                hard_limit_secs: whole_secs(self.hard_limit),
            })
            .await?;
        tracing::info!(
            task_id = id,
            kind,
            article_id = %payload.article_id,
            assets = payload.assets.len(),
            "Queued asset task"
        );
        Ok(id)
    }
}

/// Limits are stored in whole seconds; round up so a sub-second limit never becomes zero
fn whole_secs(limit: Duration) -> u64 {
    let secs = limit.as_secs().saturating_add(u64::from(limit.subsec_nanos() > 0));
    secs.max(1)
}
