//! Test configuration helpers: isolated volumes, databases and contexts

use news_ingest::config::{CheckpointBackend, RetryConfig};
use news_ingest::orchestrator::FixedUsage;
use news_ingest::{AppContext, Config, TaskQueue};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Usage reported by the fake probe until a test changes it
pub const HEALTHY_USAGE: (u64, u64) = (50, 100);

/// Retry policy that never sleeps in tests
pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        backoff_multiplier: 1.0,
        jitter: false,
    }
}

/// Configuration rooted entirely inside `root`
///
/// One volume named "default" at `<root>/volume`, databases under
/// `<root>/data`, logs under `<root>/logs`. ffmpeg is never searched for and
/// the blacklist is empty so loopback URLs are fetched.
pub fn test_config(root: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.storage.volumes = BTreeMap::from([("default".to_string(), root.join("volume"))]);
    config.storage.active_volume = "default".to_string();
    config.storage.warn_threshold = 0.9;

    config.persistence.database_path = root.join("data/news-ingest.db");
    config.persistence.checkpoint_path = root.join("data/checkpoint.db");
    config.persistence.checkpoint_backend = CheckpointBackend::Sqlite;
    config.ingest.log_dir = root.join("logs");
    config.ingest.max_workers = 2;

    config.frontier.fetch_retry = fast_retry(0);
    config.frontier.request_timeout = Duration::from_secs(5);

    config.download.search_path = false;
    config.download.blacklist.domains.clear();
    config.download.request_timeout = Duration::from_secs(5);
    config.download.asset_timeout = Duration::from_secs(10);

    config.worker.concurrency = 1;
    config.worker.poll_interval = Duration::from_millis(50);
    config.worker.retry = fast_retry(3);
    config
}

/// Isolated environment: temp directory, config and a controllable usage probe
pub struct TestEnv {
    /// Keeps every file alive for the test's duration
    pub temp_dir: TempDir,
    /// Effective configuration; edit before calling [`TestEnv::context`]
    pub config: Config,
    /// Fake volume usage shared with every context built from this env
    pub usage: Arc<FixedUsage>,
}

impl TestEnv {
    /// Fresh environment with usage at 50%
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = test_config(temp_dir.path());
        let (used, total) = HEALTHY_USAGE;
        Self {
            temp_dir,
            config,
            usage: Arc::new(FixedUsage::new(used, total)),
        }
    }

    /// Root of the active volume
    pub fn storage_root(&self) -> PathBuf {
        self.temp_dir.path().join("volume")
    }

    /// Default pause sentinel of the active volume
    pub fn pause_file(&self) -> PathBuf {
        self.storage_root().join(news_ingest::config::PAUSE_FILE_NAME)
    }

    /// `fetch_failures.ndjson` of the crawl loop
    pub fn failure_log(&self) -> PathBuf {
        self.config.ingest.log_dir.join(news_ingest::ingest::FETCH_FAILURE_LOG)
    }

    /// Context built from the current config, wired to the fake probe
    pub async fn context(&self) -> Arc<AppContext> {
        self.context_with(|ctx| ctx).await
    }

    /// Context with extra wiring applied before it is shared
    pub async fn context_with<F>(&self, customize: F) -> Arc<AppContext>
    where
        F: FnOnce(AppContext) -> AppContext,
    {
        std::fs::create_dir_all(self.storage_root()).expect("Failed to create volume dir");
        let ctx = AppContext::from_config(self.config.clone())
            .await
            .expect("Failed to build context")
            .with_usage_probe(self.usage.clone());
        Arc::new(customize(ctx))
    }

    /// Context whose queue stamps the given time limits on new tasks
    pub async fn context_with_limits(&self, soft: Duration, hard: Duration) -> Arc<AppContext> {
        self.context_with(|ctx| {
            let queue: TaskQueue = ctx.queue.clone().with_limits(soft, hard);
            ctx.with_queue(queue)
        })
        .await
    }
}
