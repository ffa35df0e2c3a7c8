//! Dedupe/checkpoint store
//!
//! Remembers which article URLs have already been emitted, across runs. The
//! store answers one question through [`CheckpointStore::upsert`]: is this URL
//! new or materially changed (different `lastmod` or image hint)?
//!
//! ## Backends
//!
//! - [`sqlite`] - single-table SQLite database in WAL mode; each upsert is one
//!   atomic `INSERT ... ON CONFLICT DO UPDATE ... WHERE` statement
//! - [`json`] - one JSON object file, rewritten through a temp file and an
//!   atomic rename
//!
//! The backend is picked once at startup from [`CheckpointBackend`]. `Auto`
//! prefers SQLite and degrades to the JSON file when the engine cannot open
//! the path.

use crate::config::CheckpointBackend;
use crate::error::Result;
use crate::types::CrawlJob;
use crate::utils::{canonicalize_url, sha256_hex};
use serde::{Deserialize, Serialize};
use std::path::Path;

mod json;
mod sqlite;

pub use json::JsonCheckpoint;
pub use sqlite::SqliteCheckpoint;

/// What the store remembers about one URL
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// URL as emitted
    pub url: String,
    /// Last modification timestamp
    #[serde(default)]
    pub lastmod: Option<String>,
    /// Sitemap or page the URL was found on
    #[serde(default, alias = "sitemap_url")]
    pub source_locator: Option<String>,
    /// Lead image announced by the source
    #[serde(default, alias = "image_url")]
    pub image_hint: Option<String>,
}

impl From<&CrawlJob> for CheckpointRecord {
    fn from(job: &CrawlJob) -> Self {
        Self {
            url: job.url.clone(),
            lastmod: job.lastmod.clone(),
            source_locator: job.source_locator.clone(),
            image_hint: job.image_hint.clone(),
        }
    }
}

impl CheckpointRecord {
    /// Primary key: sha256 of the canonical URL
    pub fn key(&self) -> String {
        checkpoint_key(&self.url)
    }

    /// Whether `incoming` should re-emit a URL stored as `self`
    ///
    /// A missing value in `incoming` never counts as a change.
    fn changed_by(&self, incoming: &CheckpointRecord) -> bool {
        let differs = |new: &Option<String>, old: &Option<String>| {
            new.as_ref().is_some_and(|value| Some(value) != old.as_ref())
        };
        differs(&incoming.lastmod, &self.lastmod) || differs(&incoming.image_hint, &self.image_hint)
    }

    /// Fold the non-empty fields of `incoming` into `self`
    fn merge(&mut self, incoming: &CheckpointRecord) {
        self.url = incoming.url.clone();
        if incoming.lastmod.is_some() {
            self.lastmod = incoming.lastmod.clone();
        }
        if incoming.source_locator.is_some() {
            self.source_locator = incoming.source_locator.clone();
        }
        if incoming.image_hint.is_some() {
            self.image_hint = incoming.image_hint.clone();
        }
    }
}

/// Deterministic key for a URL
///
/// URLs that cannot be canonicalised are hashed as given so they still dedupe
/// against themselves.
pub fn checkpoint_key(url: &str) -> String {
    match canonicalize_url(url) {
        Some(canonical) => sha256_hex(&canonical),
        None => sha256_hex(url.trim()),
    }
}

enum Backend {
    Sqlite(SqliteCheckpoint),
    Json(JsonCheckpoint),
}

/// Checkpoint store with a backend chosen at startup
pub struct CheckpointStore {
    backend: Backend,
}

impl CheckpointStore {
    /// Open the store at `path`
    ///
    /// The JSON backend uses `path` with its extension replaced by `json`.
    pub async fn open(path: &Path, backend: CheckpointBackend) -> Result<Self> {
        let backend = match backend {
            CheckpointBackend::Sqlite => Backend::Sqlite(SqliteCheckpoint::open(path).await?),
            CheckpointBackend::Json => {
                Backend::Json(JsonCheckpoint::open(&path.with_extension("json")).await?)
            }
            CheckpointBackend::Auto => match SqliteCheckpoint::open(path).await {
                Ok(store) => Backend::Sqlite(store),
                Err(e) => {
                    let json_path = path.with_extension("json");
                    tracing::warn!(
                        error = %e,
                        path = %json_path.display(),
                        "SQLite checkpoint unavailable, falling back to JSON file"
                    );
                    Backend::Json(JsonCheckpoint::open(&json_path).await?)
                }
            },
        };
        let store = Self { backend };
        tracing::info!(backend = store.backend_name(), "Checkpoint store ready");
        Ok(store)
    }

    /// Record a URL; true iff it is new or its `lastmod`/image hint changed
    pub async fn upsert(&self, record: &CheckpointRecord) -> Result<bool> {
        match &self.backend {
            Backend::Sqlite(store) => store.upsert(record).await,
            Backend::Json(store) => store.upsert(record).await,
        }
    }

    /// Whether `upsert(record)` would report a change, without recording it
    pub async fn is_changed(&self, record: &CheckpointRecord) -> Result<bool> {
        Ok(match self.get(&record.url).await? {
            None => true,
            Some(stored) => stored.changed_by(record),
        })
    }

    /// Look up a stored record
    pub async fn get(&self, url: &str) -> Result<Option<CheckpointRecord>> {
        match &self.backend {
            Backend::Sqlite(store) => store.get(url).await,
            Backend::Json(store) => Ok(store.get(url).await),
        }
    }

    /// Whether the URL has been recorded
    pub async fn contains(&self, url: &str) -> Result<bool> {
        Ok(self.get(url).await?.is_some())
    }

    /// Number of stored URLs
    pub async fn len(&self) -> Result<usize> {
        match &self.backend {
            Backend::Sqlite(store) => store.len().await,
            Backend::Json(store) => Ok(store.len().await),
        }
    }

    /// Whether nothing has been recorded yet
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Name of the active backend
    pub fn backend_name(&self) -> &'static str {
        match &self.backend {
            Backend::Sqlite(_) => "sqlite",
            Backend::Json(_) => "json",
        }
    }

    /// Release the underlying resources
    pub async fn close(self) {
        if let Backend::Sqlite(store) = self.backend {
            store.close().await;
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
