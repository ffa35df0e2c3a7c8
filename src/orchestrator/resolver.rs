//! Optional video stream resolution before download
//!
//! Some publishers only expose the real stream URL after client-side
//! scripts run. The resolver is an external command (typically a headless
//! browser script) that prints the streams it observed as JSON.

use crate::types::{AssetKind, AssetRef};
use crate::utils::is_hls_url;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Default resolver budget
pub const DEFAULT_RESOLVER_TIMEOUT: Duration = Duration::from_secs(60);

/// A stream reported by the resolver
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ResolvedStream {
    /// Stream URL
    pub url: String,
    /// `hls`, `mp4`, ... when the resolver knows
    #[serde(default)]
    pub kind: Option<String>,
}

impl ResolvedStream {
    /// Whether this is an HLS manifest
    pub fn is_hls(&self) -> bool {
        self.kind
            .as_deref()
            .is_some_and(|k| k.eq_ignore_ascii_case("hls") || k.eq_ignore_ascii_case("mhls"))
            || is_hls_url(&self.url)
    }
}

/// Finds the playable streams of an article page
#[async_trait]
pub trait VideoResolver: Send + Sync {
    /// Streams in page order
    async fn resolve_streams(&self, article_url: &str) -> Result<Vec<ResolvedStream>>;
}

/// Runs `<program> <args...> <article_url>` and reads a JSON array from stdout
#[derive(Clone, Debug)]
pub struct CommandVideoResolver {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandVideoResolver {
    /// Resolver for `command` (program first)
    pub fn new(command: &[String], timeout: Duration) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .filter(|(program, _)| !program.trim().is_empty())
            .ok_or_else(|| Error::config("video.resolver_command", "command is empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }

    /// Program and arguments
    pub fn command(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Time budget
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl VideoResolver for CommandVideoResolver {
    async fn resolve_streams(&self, article_url: &str) -> Result<Vec<ResolvedStream>> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(article_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::ExternalTool(format!(
                    "failed to execute resolver {}: {e}",
                    self.program
                )));
            }
            Err(_) => {
                return Err(Error::ExternalTool(format!(
                    "resolver {} timed out after {}s",
                    self.program,
                    self.timeout.as_secs()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ExternalTool(format!(
                "resolver {} failed with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(Vec::new());
        }
        let streams: Vec<ResolvedStream> = serde_json::from_str(stdout)?;
        Ok(streams.into_iter().filter(|s| !s.url.trim().is_empty()).collect())
    }
}

/// Fold resolved streams into an article's assets
///
/// HLS streams are preferred. Streams replace the video assets in sequence
/// order; extra streams are appended as new videos after the highest
/// sequence. Returns the new asset list (sorted by sequence) and the number
/// of assets replaced or added.
pub fn apply_streams(
    assets: Vec<AssetRef>,
    streams: Vec<ResolvedStream>,
    article_url: &str,
) -> (Vec<AssetRef>, usize) {
    let mut candidates = streams;
    candidates.sort_by_key(|s| !s.is_hls());
    let mut seen = HashSet::new();
    candidates.retain(|s| seen.insert(s.url.clone()));

    let mut assets = assets;
    assets.sort_by_key(|a| a.sequence);

    let mut changed = 0;
    let mut candidates = candidates.into_iter();
    for asset in assets.iter_mut().filter(|a| a.kind == AssetKind::Video) {
        let Some(stream) = candidates.next() else {
            break;
        };
        if stream.url != asset.source_url {
            asset.source_url = stream.url;
            changed += 1;
        }
    }

    let known: HashSet<String> = assets.iter().map(|a| a.source_url.clone()).collect();
    let mut next_sequence = assets.iter().map(|a| a.sequence).max().unwrap_or(0) + 1;
    for stream in candidates.filter(|s| !known.contains(&s.url)) {
        let mut asset = AssetRef::new(stream.url, AssetKind::Video, next_sequence);
        asset.referrer = Some(article_url.to_string());
        assets.push(asset);
        next_sequence += 1;
        changed += 1;
    }

    (assets, changed)
}
