//! Asset manager
//!
//! Downloads the media referenced by an article into
//! `<storage_root>/articles/<article_id>/{images|videos}/{sequence:03}.{ext}`.
//!
//! For each asset, in sequence order:
//! 1. inline `data:` URIs and repeated source URLs are skipped
//! 2. blacklisted URLs are skipped without any request
//! 3. a matching probe rule may swap the URL for an HLS manifest
//! 4. HLS manifests are remuxed to MP4 by the [`Transcoder`]
//! 5. everything else is streamed with an incremental sha256
//!
//! Every file is written to a `.part` sibling first and renamed into place,
//! so a visible asset file is always complete and non-empty. Downloads run
//! concurrently (bounded) but results are returned in sequence order.

use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::types::{ArticleId, AssetKind, AssetRef, StoredAsset};
use crate::utils::{extension_from_url, is_hls_url};
use crate::Result;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub mod policy;
pub mod probe;
pub mod transcode;

pub use policy::{AssetBlacklist, NoHeaders, ReferrerPolicy, RequestHeaderPolicy};
pub use probe::ProbeRules;
pub use transcode::{
    FfmpegTranscoder, NoOpTranscoder, TranscodeRequest, Transcoder, transcoder_from_config,
};

/// Outcome of a batch where each asset succeeds or fails on its own
#[derive(Debug, Default)]
pub struct AssetBatch {
    /// Written assets, in sequence order
    pub stored: Vec<StoredAsset>,
    /// Assets that could not be written, in sequence order
    pub failed: Vec<(AssetRef, DownloadError)>,
    /// Assets skipped by the blacklist
    pub blocked: Vec<AssetRef>,
}

/// Downloads article media to the storage volume
#[derive(Clone)]
pub struct AssetManager {
    client: reqwest::Client,
    storage_root: PathBuf,
    user_agent: String,
    asset_timeout: Duration,
    hls_timeout: Duration,
    max_concurrent: usize,
    headers: Arc<dyn RequestHeaderPolicy>,
    blacklist: Arc<AssetBlacklist>,
    probes: Arc<ProbeRules>,
    transcoder: Arc<dyn Transcoder>,
}

impl AssetManager {
    /// Manager writing under `storage_root`
    ///
    /// Uses the [`ReferrerPolicy`] and the transcoder selected by
    /// [`transcoder_from_config`]; both can be replaced.
    pub fn new(
        client: reqwest::Client,
        storage_root: impl Into<PathBuf>,
        user_agent: impl Into<String>,
        config: &DownloadConfig,
    ) -> Result<Self> {
        Ok(Self {
            client,
            storage_root: storage_root.into(),
            user_agent: user_agent.into(),
            asset_timeout: config.asset_timeout,
            hls_timeout: config.hls_download_timeout,
            max_concurrent: config.max_concurrent_assets.max(1),
            headers: Arc::new(ReferrerPolicy),
            blacklist: Arc::new(AssetBlacklist::new(&config.blacklist)),
            probes: Arc::new(ProbeRules::compile(&config.probe_rules)?),
            transcoder: transcoder_from_config(config),
        })
    }

    /// Replace the transcoder
    pub fn with_transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = transcoder;
        self
    }

    /// Replace the header policy
    pub fn with_header_policy(mut self, headers: Arc<dyn RequestHeaderPolicy>) -> Self {
        self.headers = headers;
        self
    }

    /// Directory holding one article's assets
    pub fn article_dir(&self, article_id: ArticleId) -> PathBuf {
        self.storage_root.join("articles").join(article_id.to_string())
    }

    /// Final path of an asset, given the URL it is fetched from
    pub fn target_path(&self, article_id: ArticleId, asset: &AssetRef, fetch_url: &str) -> PathBuf {
        let extension = if asset.kind == AssetKind::Video && is_hls_url(fetch_url) {
            "mp4".to_string()
        } else {
            extension_from_url(fetch_url, asset.kind.default_extension())
        };
        self.article_dir(article_id)
            .join(asset.kind.dir_name())
            .join(format!("{:03}.{extension}", asset.sequence))
    }

    /// Download every asset, failing on the first asset that fails
    ///
    /// Assets written before the failure stay on disk; a retry overwrites
    /// them.
    pub async fn download(&self, article_id: ArticleId, assets: Vec<AssetRef>) -> Result<Vec<StoredAsset>> {
        let batch = self.download_each(article_id, assets).await;
        match batch.failed.into_iter().next() {
            Some((asset, error)) => Err(error.for_asset(asset.kind, asset.sequence).into()),
            None => Ok(batch.stored),
        }
    }

    /// Download every asset, collecting per-asset failures
    pub async fn download_each(&self, article_id: ArticleId, assets: Vec<AssetRef>) -> AssetBatch {
        self.download_each_until(article_id, assets, &CancellationToken::new())
            .await
    }

    /// Like [`download_each`](Self::download_each), but assets not yet
    /// started when `cancel` fires fail with [`DownloadError::Cancelled`]
    ///
    /// Downloads already in flight run to completion.
    pub async fn download_each_until(
        &self,
        article_id: ArticleId,
        assets: Vec<AssetRef>,
        cancel: &CancellationToken,
    ) -> AssetBatch {
        let mut batch = AssetBatch::default();
        let mut pending = Vec::new();
        for asset in prepare(assets) {
            if self.blacklist.is_blocked(&asset.source_url) {
                tracing::debug!(article_id = %article_id, url = %asset.source_url, "Skipping blacklisted asset");
                batch.blocked.push(asset);
            } else {
                pending.push(asset);
            }
        }

        let results: Vec<_> = futures::stream::iter(pending)
            .map(|asset| async move {
                if cancel.is_cancelled() {
                    let url = asset.source_url.clone();
                    return (asset, Err(DownloadError::Cancelled { url }));
                }
                let result = self.fetch_one(article_id, &asset).await;
                (asset, result)
            })
            .buffered(self.max_concurrent)
            .collect()
            .await;

        for (asset, result) in results {
            match result {
                Ok(stored) => batch.stored.push(stored),
                Err(e) => {
                    tracing::warn!(
                        article_id = %article_id,
                        kind = %asset.kind,
                        sequence = asset.sequence,
                        url = %asset.source_url,
                        error = %e,
                        "Asset download failed"
                    );
                    batch.failed.push((asset, e));
                }
            }
        }

        tracing::info!(
            article_id = %article_id,
            stored = batch.stored.len(),
            failed = batch.failed.len(),
            blocked = batch.blocked.len(),
            "Asset batch finished"
        );
        batch
    }

    /// Remove `.part` files left in an article directory by an aborted batch
    pub async fn remove_partials(&self, article_id: ArticleId) -> Result<usize> {
        let mut removed = 0;
        for kind in [AssetKind::Image, AssetKind::Video] {
            let dir = self.article_dir(article_id).join(kind.dir_name());
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "part") {
                    tokio::fs::remove_file(&path).await?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tracing::debug!(article_id = %article_id, removed, "Removed partial asset files");
        }
        Ok(removed)
    }

    async fn fetch_one(&self, article_id: ArticleId, asset: &AssetRef) -> std::result::Result<StoredAsset, DownloadError> {
        // Probe rules only map video pages to streams
        let fetch_url = if asset.kind != AssetKind::Video || self.probes.is_empty() {
            asset.source_url.clone()
        } else {
            self.probes
                .resolve(&self.client, &asset.source_url)
                .await
                .unwrap_or_else(|| asset.source_url.clone())
        };

        let target = self.target_path(article_id, asset, &fetch_url);
        let part = part_path(&target);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| write_error(parent, e))?;
        }

        let headers = self.headers.headers(asset);
        let written = if asset.kind == AssetKind::Video && is_hls_url(&fetch_url) {
            self.transcode_to(&fetch_url, &part, &headers).await
        } else {
            self.stream_to(&fetch_url, &part, &headers).await
        };

        let (checksum, bytes_written) = match written {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&part, &target).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(write_error(&target, e));
        }

        tracing::debug!(
            article_id = %article_id,
            path = %target.display(),
            bytes = bytes_written,
            "Asset stored"
        );

        let mut source = asset.clone();
        source.source_url = fetch_url;
        Ok(StoredAsset {
            source,
            path: target,
            checksum,
            bytes_written,
        })
    }

    async fn stream_to(
        &self,
        url: &str,
        part: &Path,
        headers: &[(String, String)],
    ) -> std::result::Result<(String, u64), DownloadError> {
        let mut request = self.client.get(url).timeout(self.asset_timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await.map_err(|e| transport_error(url, &e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(part).await.map_err(|e| write_error(part, e))?;
        let mut hasher = Sha256::new();
        let mut bytes_written = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| transport_error(url, &e))?;
            if chunk.is_empty() {
                continue;
            }
            file.write_all(&chunk).await.map_err(|e| write_error(part, e))?;
            hasher.update(&chunk);
            bytes_written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| write_error(part, e))?;
        file.sync_all().await.map_err(|e| write_error(part, e))?;

        if bytes_written == 0 {
            return Err(DownloadError::EmptyBody { url: url.to_string() });
        }
        Ok((format!("{:x}", hasher.finalize()), bytes_written))
    }

    async fn transcode_to(
        &self,
        url: &str,
        part: &Path,
        headers: &[(String, String)],
    ) -> std::result::Result<(String, u64), DownloadError> {
        tracing::info!(url = %url, transcoder = self.transcoder.name(), "Remuxing HLS stream");
        self.transcoder
            .remux(&TranscodeRequest {
                source_url: url,
                output: part,
                headers,
                user_agent: &self.user_agent,
                timeout: self.hls_timeout,
            })
            .await?;

        let (checksum, bytes_written) = hash_file(part).await.map_err(|e| write_error(part, e))?;
        if bytes_written == 0 {
            return Err(DownloadError::EmptyBody { url: url.to_string() });
        }
        Ok((checksum, bytes_written))
    }
}

/// Order by sequence, drop inline data and repeated source URLs
fn prepare(mut assets: Vec<AssetRef>) -> Vec<AssetRef> {
    assets.sort_by_key(|a| a.sequence);
    let mut seen = HashSet::new();
    assets
        .into_iter()
        .filter(|asset| {
            let url = asset.source_url.trim();
            if url.is_empty() || url.starts_with("data:") {
                return false;
            }
            seen.insert(url.to_string())
        })
        .collect()
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}

async fn hash_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), total))
}

fn transport_error(url: &str, e: &reqwest::Error) -> DownloadError {
    DownloadError::Transport {
        url: url.to_string(),
        reason: e.to_string(),
        timeout: e.is_timeout(),
    }
}

fn write_error(path: &Path, e: std::io::Error) -> DownloadError {
    DownloadError::Write {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
