//! Self-contained task payloads
//!
//! A payload carries everything a worker needs to process one article's
//! assets without reading the crawler's configuration: where to write, how
//! to fetch, and which CDN rules apply. It is stored as JSON in the task
//! record.

use crate::config::{
    BlacklistConfig, Config, DownloadConfig, PAUSE_FILE_NAME, ProbeRule, ProxyConfig,
    normalize_threshold,
};
use crate::db::StorageLocation;
use crate::types::{ArticleId, AssetKind, AssetRef};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Task kind that downloads assets
pub const DOWNLOAD_ASSETS: &str = "download_assets";

/// Task kind that resolves video streams, then enqueues a download
pub const RESOLVE_VIDEOS: &str = "resolve_videos";

/// One unit of asset work
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Article the assets belong to
    pub article_id: ArticleId,
    /// Bookkeeping database the article lives in
    pub db_url: String,
    /// Article page, default referrer and resolver input
    pub article_url: String,
    /// Site slug
    pub site: String,
    /// Assets to fetch, in authored order
    pub assets: Vec<AssetRef>,
    /// Storage and fetch settings
    pub config: PayloadConfig,
    /// Resolve stage settings; absent when no resolve stage runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolve: Option<ResolveSettings>,
}

/// Storage and fetch settings frozen at enqueue time
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PayloadConfig {
    /// Root under which `articles/<id>/...` is written
    pub storage_root: PathBuf,
    /// Active volume name
    #[serde(default = "default_volume_name")]
    pub storage_volume: String,
    /// Active volume mount path (defaults to `storage_root`)
    #[serde(default)]
    pub storage_volume_root: Option<PathBuf>,
    /// Usage fraction that trips the breaker
    #[serde(default = "default_warn_threshold")]
    pub storage_warn_threshold: f64,
    /// Pause sentinel (defaults to `<volume root>/.pause_ingest`)
    #[serde(default)]
    pub storage_pause_file: Option<PathBuf>,
    /// User agent for asset requests
    pub user_agent: String,
    /// Probe request timeout in seconds
    pub request_timeout: u64,
    /// Per-asset timeout in seconds
    pub asset_timeout: u64,
    /// HLS remux budget in seconds
    pub hls_download_timeout: u64,
    /// Outbound proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    /// CDN probe rules
    #[serde(default)]
    pub probe_rules: Vec<ProbeRule>,
    /// Asset blacklist
    #[serde(default)]
    pub blacklist: BlacklistConfig,
}

/// External video resolver invocation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveSettings {
    /// Program and arguments; the article URL is appended
    pub command: Vec<String>,
    /// Budget in seconds
    pub timeout: u64,
}

fn default_volume_name() -> String {
    "default".to_string()
}

fn default_warn_threshold() -> f64 {
    0.9
}

impl PayloadConfig {
    /// Freeze the storage and download settings of `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let volume_root = config.storage.active_volume_path()?.to_path_buf();
        Ok(Self {
            storage_root: config.storage.storage_root()?,
            storage_volume: config.storage.active_volume.clone(),
            storage_volume_root: Some(volume_root),
            storage_warn_threshold: config.storage.effective_warn_threshold(),
            storage_pause_file: Some(config.storage.pause_file_path()?),
            user_agent: config.user_agent.clone(),
            request_timeout: config.download.request_timeout.as_secs(),
            asset_timeout: config.download.asset_timeout.as_secs(),
            hls_download_timeout: config.download.hls_download_timeout.as_secs(),
            proxy: config.proxy.clone(),
            probe_rules: config.download.probe_rules.clone(),
            blacklist: config.download.blacklist.clone(),
        })
    }

    /// Mount path of the volume the assets go to
    pub fn volume_root(&self) -> &Path {
        self.storage_volume_root.as_deref().unwrap_or(&self.storage_root)
    }

    /// Effective pause sentinel
    pub fn pause_file(&self) -> PathBuf {
        self.storage_pause_file
            .clone()
            .unwrap_or_else(|| self.volume_root().join(PAUSE_FILE_NAME))
    }

    /// Normalised warn threshold
    pub fn warn_threshold(&self) -> f64 {
        normalize_threshold(self.storage_warn_threshold)
    }

    /// How stored paths are referenced in the database
    pub fn storage_location(&self) -> StorageLocation {
        StorageLocation {
            storage_root: self.storage_root.clone(),
            volume_name: Some(self.storage_volume.clone()),
            volume_path: Some(self.volume_root().to_path_buf()),
        }
    }

    /// Download settings: the payload's values over the worker's `base`
    ///
    /// Transcoder location and concurrency stay the worker's own.
    pub fn download_config(&self, base: &DownloadConfig) -> DownloadConfig {
        DownloadConfig {
            request_timeout: Duration::from_secs(self.request_timeout),
            asset_timeout: Duration::from_secs(self.asset_timeout),
            hls_download_timeout: Duration::from_secs(self.hls_download_timeout),
            probe_rules: self.probe_rules.clone(),
            blacklist: self.blacklist.clone(),
            ..base.clone()
        }
    }
}

impl TaskPayload {
    /// Whether any asset is a video
    pub fn has_videos(&self) -> bool {
        self.assets.iter().any(|a| a.kind == AssetKind::Video)
    }

    /// Task kind to enqueue this payload under
    pub fn task_kind(&self) -> &'static str {
        if self.resolve.is_some() && self.has_videos() {
            RESOLVE_VIDEOS
        } else {
            DOWNLOAD_ASSETS
        }
    }

    /// Serialize for the task record
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a task record payload
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
