//! Storage capacity circuit breaker
//!
//! The breaker is a sentinel file. Any process that sees usage at or above
//! the warn threshold creates it; every process treats its presence as
//! "paused" until an operator removes it. Two processes racing to create it
//! is harmless.

use super::notify::{StorageNotifier, ThresholdAlert};
use crate::config::StorageConfig;
use crate::utils::{VolumeUsage, get_volume_usage};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Source of volume usage figures
pub trait UsageProbe: Send + Sync {
    /// Usage of the filesystem holding `path`
    fn usage(&self, path: &Path) -> Result<VolumeUsage>;
}

/// Reads usage from the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl UsageProbe for StatvfsProbe {
    fn usage(&self, path: &Path) -> Result<VolumeUsage> {
        get_volume_usage(path)
            .map_err(|e| Error::DiskSpaceCheckFailed(format!("{}: {}", path.display(), e)))
    }
}

/// Watches one volume and owns its pause sentinel
#[derive(Clone)]
pub struct StorageMonitor {
    volume_path: PathBuf,
    pause_file: PathBuf,
    warn_threshold: f64,
    probe: Arc<dyn UsageProbe>,
    notifier: Option<Arc<dyn StorageNotifier>>,
}

impl StorageMonitor {
    /// Monitor with the OS probe and no notifier
    pub fn new(volume_path: impl Into<PathBuf>, pause_file: impl Into<PathBuf>, warn_threshold: f64) -> Self {
        Self {
            volume_path: volume_path.into(),
            pause_file: pause_file.into(),
            warn_threshold,
            probe: Arc::new(StatvfsProbe),
            notifier: None,
        }
    }

    /// Monitor for the active volume of `config`
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        Ok(Self::new(
            config.active_volume_path()?,
            config.pause_file_path()?,
            config.effective_warn_threshold(),
        ))
    }

    /// Replace the usage probe
    pub fn with_probe(mut self, probe: Arc<dyn UsageProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Notify this observer when the breaker trips
    pub fn with_notifier(mut self, notifier: Option<Arc<dyn StorageNotifier>>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Same probe and notifier, different volume
    pub fn for_volume(&self, volume_path: impl Into<PathBuf>, pause_file: impl Into<PathBuf>, warn_threshold: f64) -> Self {
        Self {
            volume_path: volume_path.into(),
            pause_file: pause_file.into(),
            warn_threshold,
            probe: Arc::clone(&self.probe),
            notifier: self.notifier.clone(),
        }
    }

    /// Watched volume
    pub fn volume_path(&self) -> &Path {
        &self.volume_path
    }

    /// Sentinel path
    pub fn pause_file(&self) -> &Path {
        &self.pause_file
    }

    /// Threshold fraction
    pub fn warn_threshold(&self) -> f64 {
        self.warn_threshold
    }

    /// Whether the sentinel exists
    pub async fn is_paused(&self) -> bool {
        tokio::fs::try_exists(&self.pause_file).await.unwrap_or(false)
    }

    /// Current usage of the volume
    pub fn usage(&self) -> Result<VolumeUsage> {
        self.probe.usage(&self.volume_path)
    }

    /// `(total - free) / total` of the volume
    pub fn usage_fraction(&self) -> Result<f64> {
        Ok(self.usage()?.used_fraction())
    }

    /// Whether ingestion must stay paused
    ///
    /// True when the sentinel exists. Otherwise, when usage is at or above
    /// the threshold, the sentinel is created, the notifier is told (its
    /// failure is only logged) and true is returned.
    pub async fn check_and_maybe_pause(&self) -> Result<bool> {
        if self.is_paused().await {
            return Ok(true);
        }

        let fraction = self.usage_fraction()?;
        if fraction < self.warn_threshold {
            return Ok(false);
        }

        tracing::warn!(
            volume = %self.volume_path.display(),
            usage_percent = %format!("{:.2}", fraction * 100.0),
            threshold_percent = %format!("{:.0}", self.warn_threshold * 100.0),
            pause_file = %self.pause_file.display(),
            "Storage volume over capacity threshold; pausing ingestion"
        );
        self.pause(&format!(
            "usage {:.2}% reached threshold {:.2}%",
            fraction * 100.0,
            self.warn_threshold * 100.0
        ))
        .await?;

        if let Some(notifier) = &self.notifier {
            let alert = ThresholdAlert {
                volume_path: &self.volume_path,
                usage_fraction: fraction,
                threshold_fraction: self.warn_threshold,
                pause_file: &self.pause_file,
            };
            if let Err(e) = notifier.notify_threshold(&alert).await {
                tracing::warn!(notifier = notifier.name(), error = %e, "Failed to send storage notification");
            }
        }
        Ok(true)
    }

    /// Create the sentinel, recording `reason` in it
    pub async fn pause(&self, reason: &str) -> Result<()> {
        if let Some(parent) = self.pause_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = format!("{}\t{}\n", chrono::Utc::now().to_rfc3339(), reason.trim());
        tokio::fs::write(&self.pause_file, body).await?;
        tracing::info!(pause_file = %self.pause_file.display(), reason, "Ingestion paused");
        Ok(())
    }

    /// Remove the sentinel; returns whether it existed
    pub async fn resume(&self) -> Result<bool> {
        match tokio::fs::remove_file(&self.pause_file).await {
            Ok(()) => {
                tracing::info!(pause_file = %self.pause_file.display(), "Ingestion resumed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Probe returning fixed figures, for tests and dry runs
#[derive(Debug)]
pub struct FixedUsage(pub std::sync::Mutex<VolumeUsage>);

impl FixedUsage {
    /// Probe reporting `used` out of `total` bytes
    pub fn new(used: u64, total: u64) -> Self {
        Self(std::sync::Mutex::new(VolumeUsage {
            total_bytes: total,
            free_bytes: total.saturating_sub(used),
        }))
    }

    /// Change the reported usage
    pub fn set(&self, used: u64, total: u64) {
        if let Ok(mut usage) = self.0.lock() {
            *usage = VolumeUsage {
                total_bytes: total,
                free_bytes: total.saturating_sub(used),
            };
        }
    }
}

impl UsageProbe for FixedUsage {
    fn usage(&self, _path: &Path) -> Result<VolumeUsage> {
        self.0
            .lock()
            .map(|usage| *usage)
            .map_err(|_| Error::DiskSpaceCheckFailed("usage probe poisoned".to_string()))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingNotifier {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl StorageNotifier for CountingNotifier {
        async fn notify_threshold(&self, alert: &ThresholdAlert<'_>) -> Result<()> {
            assert!(alert.usage_fraction >= alert.threshold_fraction);
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Other("chat not found".to_string()));
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn monitor(dir: &TempDir, probe: Arc<FixedUsage>) -> StorageMonitor {
        StorageMonitor::new(dir.path(), dir.path().join("flags/.pause_ingest"), 0.9).with_probe(probe)
    }

    #[tokio::test]
    async fn below_threshold_does_not_pause() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir, Arc::new(FixedUsage::new(50, 100)));

        assert!(!monitor.check_and_maybe_pause().await.unwrap());
        assert!(!monitor.is_paused().await);
        assert!((monitor.usage_fraction().unwrap() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reaching_threshold_creates_sentinel_and_notifies_once() {
        let dir = TempDir::new().unwrap();
        let notifier = Arc::new(CountingNotifier {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let monitor = monitor(&dir, Arc::new(FixedUsage::new(90, 100)))
            .with_notifier(Some(notifier.clone() as Arc<dyn StorageNotifier>));

        assert!(monitor.check_and_maybe_pause().await.unwrap());
        assert!(monitor.pause_file().exists());
        assert!(monitor.check_and_maybe_pause().await.unwrap(), "sentinel keeps it paused");
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn notifier_failure_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let notifier = Arc::new(CountingNotifier {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let monitor = monitor(&dir, Arc::new(FixedUsage::new(99, 100)))
            .with_notifier(Some(notifier as Arc<dyn StorageNotifier>));

        assert!(monitor.check_and_maybe_pause().await.unwrap());
        assert!(monitor.is_paused().await);
    }

    #[tokio::test]
    async fn sentinel_pauses_regardless_of_usage_until_resumed() {
        let dir = TempDir::new().unwrap();
        let probe = Arc::new(FixedUsage::new(10, 100));
        let monitor = monitor(&dir, probe.clone());

        monitor.pause("manual maintenance").await.unwrap();
        let contents = std::fs::read_to_string(monitor.pause_file()).unwrap();
        assert!(contents.contains("manual maintenance"));
        assert!(monitor.check_and_maybe_pause().await.unwrap());

        assert!(monitor.resume().await.unwrap());
        assert!(!monitor.resume().await.unwrap(), "second resume is a no-op");
        assert!(!monitor.check_and_maybe_pause().await.unwrap());

        probe.set(95, 100);
        assert!(monitor.check_and_maybe_pause().await.unwrap());
    }

    #[test]
    fn os_probe_reads_the_temp_volume() {
        let dir = TempDir::new().unwrap();
        let monitor = StorageMonitor::new(dir.path(), dir.path().join(".pause_ingest"), 0.9);
        let fraction = monitor.usage_fraction().unwrap();
        assert!((0.0..=1.0).contains(&fraction));
    }
}
