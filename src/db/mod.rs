//! Database layer for news-ingest
//!
//! Handles SQLite persistence for articles, stored assets, media bookkeeping
//! and the download task queue.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`articles`] - Article metadata and stored asset rows
//! - [`media`] - Deferred videos and failed media downloads
//! - [`tasks`] - Durable download task queue

use crate::types::{ArticleId, AssetKind, AssetRef};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, sqlite::SqlitePool};
use std::path::{Path, PathBuf};

mod articles;
mod media;
mod migrations;
mod tasks;

pub use media::category_key;

/// Where stored asset paths are made relative to
///
/// Asset rows hold `"<volume>:<relative path>"` when the file lives under the
/// named volume, otherwise a path relative to `storage_root`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageLocation {
    /// Root passed to the asset manager
    pub storage_root: PathBuf,
    /// Active volume name
    pub volume_name: Option<String>,
    /// Active volume path
    pub volume_path: Option<PathBuf>,
}

impl StorageLocation {
    /// Reference stored in the database for `path`
    pub fn asset_reference(&self, path: &Path) -> String {
        if let Some(volume_path) = &self.volume_path
            && let Ok(relative) = path.strip_prefix(volume_path)
        {
            let relative = to_posix(relative);
            return match &self.volume_name {
                Some(name) => format!("{name}:{relative}"),
                None => relative,
            };
        }
        match path.strip_prefix(&self.storage_root) {
            Ok(relative) => to_posix(relative),
            Err(_) => to_posix(path),
        }
    }
}

fn to_posix(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Article record from database
#[derive(Debug, Clone, FromRow)]
pub struct ArticleRow {
    /// Article ID
    pub id: ArticleId,
    /// Site slug
    pub site_slug: String,
    /// Canonical article URL
    pub url: String,
    /// Headline
    pub title: String,
    /// Lead/summary
    pub description: Option<String>,
    /// Body text
    pub content: String,
    /// Publisher category id
    pub category_id: Option<String>,
    /// Publisher category name
    pub category_name: Option<String>,
    /// Comma-separated tags
    pub tags: Option<String>,
    /// Unix timestamp of publication
    pub publish_date: Option<i64>,
    /// Unix timestamp when first stored
    pub created_at: i64,
    /// Unix timestamp of the last update
    pub updated_at: i64,
}

/// Stored asset row
#[derive(Debug, Clone, FromRow)]
pub struct AssetRow {
    /// Article the asset belongs to
    pub article_id: ArticleId,
    /// `image` or `video`
    pub kind: String,
    /// Sequence within the article
    pub sequence: i64,
    /// Volume-qualified path reference
    pub path: String,
    /// URL the file was fetched from
    pub source_url: String,
    /// Hex sha256 of the file
    pub checksum: String,
    /// File size
    pub bytes: i64,
}

/// Bookkeeping status of a deferred video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeferredStatus {
    /// Skipped by the category policy, waiting for re-drive
    Deferred,
    /// Re-driven into the task queue
    Enqueued,
    /// Downloaded
    Resolved,
}

impl DeferredStatus {
    /// Stored name
    pub fn as_str(&self) -> &'static str {
        match self {
            DeferredStatus::Deferred => "deferred",
            DeferredStatus::Enqueued => "enqueued",
            DeferredStatus::Resolved => "resolved",
        }
    }
}

/// Default reason stored when the category policy defers a video
pub const DEFAULT_DEFERRED_REASON: &str = "category_not_enabled";

/// Videos of one article to defer
#[derive(Debug, Clone)]
pub struct NewDeferredVideos<'a> {
    /// Owning article
    pub article_id: ArticleId,
    /// Site slug
    pub site_slug: &'a str,
    /// Article URL; default referrer
    pub article_url: &'a str,
    /// Publisher category id
    pub category_id: Option<&'a str>,
    /// Publisher category name
    pub category_name: Option<&'a str>,
    /// Category slug the crawl ran under
    pub ingest_category: Option<&'a str>,
    /// Videos to defer
    pub assets: &'a [AssetRef],
    /// Why they are deferred (defaults to [`DEFAULT_DEFERRED_REASON`])
    pub reason: Option<&'a str>,
}

/// Deferred video row
#[derive(Debug, Clone, FromRow)]
pub struct DeferredVideo {
    /// Owning article
    pub article_id: ArticleId,
    /// Sequence within the article
    pub sequence: i64,
    /// Site slug
    pub site_slug: String,
    /// Article URL
    pub article_url: String,
    /// Video URL
    pub source_url: String,
    /// Referrer sent with the download
    pub referrer: Option<String>,
    /// Caption
    pub caption: Option<String>,
    /// Lowercased first non-empty of category id, name, ingest slug
    pub category_key: Option<String>,
    /// Publisher category name
    pub category_name: Option<String>,
    /// Why the video was deferred
    pub deferred_reason: String,
    /// `deferred`, `enqueued` or `resolved`
    pub status: String,
    /// Unix timestamp of the last deferral
    pub deferred_at: i64,
    /// Unix timestamp of the last re-drive
    pub enqueued_at: Option<i64>,
    /// Unix timestamp of the download
    pub resolved_at: Option<i64>,
}

impl DeferredVideo {
    /// Asset reference for a new download payload
    pub fn to_asset(&self) -> AssetRef {
        AssetRef {
            source_url: self.source_url.clone(),
            kind: AssetKind::Video,
            sequence: u32::try_from(self.sequence).unwrap_or_default(),
            caption: self.caption.clone(),
            referrer: self.referrer.clone(),
        }
    }
}

/// Assets of one article whose download failed
#[derive(Debug, Clone)]
pub struct NewFailedMedia<'a> {
    /// Owning article
    pub article_id: ArticleId,
    /// Site slug
    pub site_slug: &'a str,
    /// Article URL; default referrer
    pub article_url: &'a str,
    /// Failed assets
    pub assets: &'a [AssetRef],
    /// `error.to_string()`
    pub error: &'a str,
    /// Error kind name
    pub error_type: Option<&'a str>,
}

/// Failed media download row
#[derive(Debug, Clone, FromRow)]
pub struct FailedMediaDownload {
    /// Owning article
    pub article_id: ArticleId,
    /// `image` or `video`
    pub media_type: String,
    /// Sequence within the article
    pub sequence: i64,
    /// Site slug
    pub site_slug: String,
    /// Article URL
    pub article_url: String,
    /// Asset URL
    pub source_url: String,
    /// Referrer sent with the download
    pub referrer: Option<String>,
    /// Caption
    pub caption: Option<String>,
    /// Number of recorded failures
    pub failure_count: i64,
    /// Last error message
    pub last_error: String,
    /// Last error kind name
    pub last_error_type: Option<String>,
    /// `pending` or `resolved`
    pub status: String,
    /// Unix timestamp of the first failure
    pub first_failed_at: i64,
    /// Unix timestamp of the last failure
    pub last_failed_at: i64,
    /// Unix timestamp of the successful retry
    pub resolved_at: Option<i64>,
}

impl FailedMediaDownload {
    /// Asset reference for a new download payload
    pub fn to_asset(&self) -> AssetRef {
        AssetRef {
            source_url: self.source_url.clone(),
            kind: AssetKind::from_name(&self.media_type).unwrap_or(AssetKind::Image),
            sequence: u32::try_from(self.sequence).unwrap_or_default(),
            caption: self.caption.clone(),
            referrer: self.referrer.clone(),
        }
    }
}

/// Filter for the bookkeeping listings
#[derive(Debug, Clone, Default)]
pub struct MediaFilter {
    /// Only this site
    pub site_slug: Option<String>,
    /// Only this article
    pub article_id: Option<ArticleId>,
    /// At most this many rows
    pub limit: Option<i64>,
}

/// Task status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for a worker
    Queued,
    /// Claimed by a worker
    Running,
    /// Finished
    Succeeded,
    /// Gave up
    Failed,
}

impl TaskStatus {
    /// Stored name
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    /// Parse a stored name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// Task to insert into the queue
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Task kind (`download_assets`, `resolve_videos`)
    pub kind: String,
    /// Self-contained JSON payload
    pub payload: String,
    /// Retries allowed after the first attempt
    pub max_attempts: u32,
    /// Cooperative cancellation deadline
    pub soft_limit_secs: u64,
    /// Forced termination deadline
    pub hard_limit_secs: u64,
}

/// Task record from database
#[derive(Debug, Clone, FromRow)]
pub struct TaskRecord {
    /// Task ID
    pub id: i64,
    /// Task kind
    pub kind: String,
    /// JSON payload
    pub payload: String,
    /// See [`TaskStatus`]
    pub status: String,
    /// Attempts started so far
    pub attempts: i64,
    /// Retries allowed after the first attempt
    pub max_attempts: i64,
    /// Unix timestamp before which the task is not claimed
    pub next_attempt_at: i64,
    /// Last error message
    pub last_error: Option<String>,
    /// Last error kind name
    pub last_error_type: Option<String>,
    /// Soft limit in seconds
    pub soft_limit_secs: i64,
    /// Hard limit in seconds
    pub hard_limit_secs: i64,
    /// Unix timestamp of creation
    pub created_at: i64,
    /// Unix timestamp of the last change
    pub updated_at: i64,
    /// Unix timestamp of the current claim
    pub started_at: Option<i64>,
}

impl TaskRecord {
    /// Parsed status
    pub fn status(&self) -> Option<TaskStatus> {
        TaskStatus::from_name(&self.status)
    }

    /// Whether another retry is allowed after the current attempt
    pub fn can_retry(&self) -> bool {
        self.attempts <= self.max_attempts
    }
}

/// Outcome of [`Database::requeue_stale_tasks`]
#[derive(Debug, Default)]
pub struct StaleTasks {
    /// Tasks put back in the queue
    pub requeued: u64,
    /// Tasks that had no retries left, now failed
    pub failed: Vec<TaskRecord>,
}

/// Database handle for news-ingest
pub struct Database {
    pool: SqlitePool,
}
