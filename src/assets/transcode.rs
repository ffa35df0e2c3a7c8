//! HLS remux through an external transcoder

use crate::config::DownloadConfig;
use crate::error::DownloadError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// Longest stderr excerpt kept in an error
const STDERR_EXCERPT: usize = 2000;

/// One remux job
#[derive(Clone, Debug)]
pub struct TranscodeRequest<'a> {
    /// Manifest URL
    pub source_url: &'a str,
    /// File to write (overwritten)
    pub output: &'a Path,
    /// Extra request headers
    pub headers: &'a [(String, String)],
    /// User agent for segment requests
    pub user_agent: &'a str,
    /// Wall-clock budget
    pub timeout: Duration,
}

/// Turns an HLS manifest into a single MP4 file
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Write `request.source_url` to `request.output`
    ///
    /// On error the caller removes the output file.
    async fn remux(&self, request: &TranscodeRequest<'_>) -> Result<(), DownloadError>;

    /// Name used in logs
    fn name(&self) -> &'static str;
}

/// Remux with the `ffmpeg` binary (`-c copy`)
#[derive(Clone, Debug)]
pub struct FfmpegTranscoder {
    binary_path: PathBuf,
}

impl FfmpegTranscoder {
    /// Use an explicit binary
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Find `ffmpeg` in PATH
    pub fn from_path() -> Option<Self> {
        which::which("ffmpeg").ok().map(Self::new)
    }

    fn command(&self, request: &TranscodeRequest<'_>) -> Command {
        let mut command = Command::new(&self.binary_path);
        command
            .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-y"])
            .args(["-user_agent", request.user_agent]);
        if !request.headers.is_empty() {
            let headers: String = request
                .headers
                .iter()
                .map(|(name, value)| format!("{name}: {value}\r\n"))
                .collect();
            command.arg("-headers").arg(headers);
        }
        command
            .arg("-i")
            .arg(request.source_url)
            .args(["-c", "copy", "-bsf:a", "aac_adtstoasc", "-f", "mp4"])
            .arg(request.output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn remux(&self, request: &TranscodeRequest<'_>) -> Result<(), DownloadError> {
        let child = self.command(request).output();
        let output = match tokio::time::timeout(request.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(DownloadError::Transcode {
                    url: request.source_url.to_string(),
                    reason: format!("failed to execute {}: {e}", self.binary_path.display()),
                });
            }
            // Dropping the future kills the child
            Err(_) => {
                return Err(DownloadError::TranscodeTimeout {
                    url: request.source_url.to_string(),
                    seconds: request.timeout.as_secs(),
                });
            }
        };

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let excerpt: String = stderr
            .chars()
            .skip(stderr.chars().count().saturating_sub(STDERR_EXCERPT))
            .collect();
        Err(DownloadError::Transcode {
            url: request.source_url.to_string(),
            reason: format!("{}: {excerpt}", output.status),
        })
    }

    fn name(&self) -> &'static str {
        "ffmpeg"
    }
}

/// Used when no transcoder binary is available; every HLS asset fails
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpTranscoder;

#[async_trait]
impl Transcoder for NoOpTranscoder {
    async fn remux(&self, request: &TranscodeRequest<'_>) -> Result<(), DownloadError> {
        Err(DownloadError::Transcode {
            url: request.source_url.to_string(),
            reason: "no transcoder available (install ffmpeg or set download.ffmpeg_path)"
                .to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Pick a transcoder from configuration
///
/// An explicit path wins; otherwise PATH is searched when allowed, and the
/// no-op transcoder is the last resort.
pub fn transcoder_from_config(config: &DownloadConfig) -> Arc<dyn Transcoder> {
    let transcoder: Arc<dyn Transcoder> = if let Some(path) = &config.ffmpeg_path {
        Arc::new(FfmpegTranscoder::new(path.clone()))
    } else if config.search_path {
        FfmpegTranscoder::from_path()
            .map(|t| Arc::new(t) as Arc<dyn Transcoder>)
            .unwrap_or_else(|| Arc::new(NoOpTranscoder))
    } else {
        Arc::new(NoOpTranscoder)
    };
    tracing::info!(transcoder = transcoder.name(), "Transcoder initialized");
    transcoder
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_path_and_disabled_search() {
        let config = DownloadConfig {
            ffmpeg_path: Some(PathBuf::from("/opt/ffmpeg/bin/ffmpeg")),
            ..DownloadConfig::default()
        };
        assert_eq!(transcoder_from_config(&config).name(), "ffmpeg");

        let config = DownloadConfig {
            ffmpeg_path: None,
            search_path: false,
            ..DownloadConfig::default()
        };
        assert_eq!(transcoder_from_config(&config).name(), "noop");
    }

    #[test]
    fn from_path_agrees_with_which() {
        assert_eq!(
            which::which("ffmpeg").is_ok(),
            FfmpegTranscoder::from_path().is_some()
        );
    }

    #[tokio::test]
    async fn missing_binary_is_a_transcode_error() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("001.mp4.part");
        let transcoder = FfmpegTranscoder::new(PathBuf::from("/nonexistent/ffmpeg-binary-xyz"));

        let err = transcoder
            .remux(&TranscodeRequest {
                source_url: "https://cdn.example.com/v/master.m3u8",
                output: &output,
                headers: &[],
                user_agent: "test",
                timeout: Duration::from_secs(5),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Transcode { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_transcoder_is_killed_at_the_budget() {
        let temp_dir = TempDir::new().unwrap();
        let script = temp_dir.path().join("slow-ffmpeg.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let output = temp_dir.path().join("001.mp4.part");

        let started = std::time::Instant::now();
        let err = FfmpegTranscoder::new(script)
            .remux(&TranscodeRequest {
                source_url: "https://cdn.example.com/v/master.m3u8",
                output: &output,
                headers: &[],
                user_agent: "test",
                timeout: Duration::from_millis(300),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::TranscodeTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
