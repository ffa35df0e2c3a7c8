//! Process-wide collaborators built once from [`Config`]

use crate::assets::{AssetBlacklist, AssetManager, ReferrerPolicy, RequestHeaderPolicy, Transcoder, transcoder_from_config};
use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::db::Database;
use crate::orchestrator::resolver::DEFAULT_RESOLVER_TIMEOUT;
use crate::orchestrator::{
    CommandVideoResolver, PayloadConfig, ResolveSettings, StorageMonitor, StorageNotifier,
    TaskQueue, UsageProbe, VideoResolver, notifier_from_config,
};
use crate::utils::build_http_client;
use crate::Result;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Shared handles passed by `Arc` to the ingest runner, workers and re-drive
pub struct AppContext {
    /// Effective configuration
    pub config: Config,
    /// Client for pages, probes and notifications
    pub http: reqwest::Client,
    /// Bookkeeping database and task queue storage
    pub db: Arc<Database>,
    /// `sqlite://` URL of `db`, stamped on payloads
    pub db_url: String,
    /// Producer side of the task queue
    pub queue: TaskQueue,
    /// Breaker for the active volume
    pub storage: StorageMonitor,
    /// HLS remuxer
    pub transcoder: Arc<dyn Transcoder>,
    /// Per-asset request headers
    pub headers: Arc<dyn RequestHeaderPolicy>,
    /// Assets never worth queuing
    pub blacklist: Arc<AssetBlacklist>,
    /// Local video resolver; overrides the command in payloads
    pub resolver: Option<Arc<dyn VideoResolver>>,
    /// Capacity alert channel
    pub notifier: Option<Arc<dyn StorageNotifier>>,
    checkpoint: OnceCell<Arc<CheckpointStore>>,
}

impl AppContext {
    /// Validate `config` and open everything it names
    ///
    /// The checkpoint store is opened lazily on first use; workers never need
    /// it.
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;

        let http = build_http_client(
            &config.user_agent,
            config.download.request_timeout,
            config.proxy.as_ref(),
        )?;
        let db_path = &config.persistence.database_path;
        let db = Arc::new(Database::new(db_path).await?);
        let db_url = format!("sqlite://{}", db_path.display());

        let notifier = notifier_from_config(&config.notifications, &http);
        let storage = StorageMonitor::from_config(&config.storage)?.with_notifier(notifier.clone());

        let resolver = match &config.video.resolver_command {
            Some(command) => {
                let timeout = config.video.resolver_timeout.unwrap_or(DEFAULT_RESOLVER_TIMEOUT);
                Some(Arc::new(CommandVideoResolver::new(command, timeout)?) as Arc<dyn VideoResolver>)
            }
            None => None,
        };

        tracing::info!(
            database = %db_path.display(),
            volume = %config.storage.active_volume,
            storage_root = %storage.volume_path().display(),
            warn_threshold = storage.warn_threshold(),
            "Context initialized"
        );

        Ok(Self {
            http,
            queue: TaskQueue::new(Arc::clone(&db), &config),
            db,
            db_url,
            storage,
            transcoder: transcoder_from_config(&config.download),
            headers: Arc::new(ReferrerPolicy),
            blacklist: Arc::new(AssetBlacklist::new(&config.download.blacklist)),
            resolver,
            notifier,
            checkpoint: OnceCell::new(),
            config,
        })
    }

    /// Replace the transcoder
    pub fn with_transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = transcoder;
        self
    }

    /// Replace the volume usage probe
    pub fn with_usage_probe(mut self, probe: Arc<dyn UsageProbe>) -> Self {
        self.storage = self.storage.with_probe(probe);
        self
    }

    /// Replace the video resolver
    pub fn with_resolver(mut self, resolver: Arc<dyn VideoResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Replace the task queue (e.g. different time limits)
    pub fn with_queue(mut self, queue: TaskQueue) -> Self {
        self.queue = queue;
        self
    }

    /// Cross-run dedupe store
    pub async fn checkpoint(&self) -> Result<Arc<CheckpointStore>> {
        let store = self
            .checkpoint
            .get_or_try_init(|| async {
                let persistence = &self.config.persistence;
                CheckpointStore::open(&persistence.checkpoint_path, persistence.checkpoint_backend)
                    .await
                    .map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(store))
    }

    /// Storage and fetch settings for new payloads
    pub fn payload_config(&self) -> Result<PayloadConfig> {
        PayloadConfig::from_config(&self.config)
    }

    /// Resolve stage for new payloads, when enabled
    pub fn resolve_settings(&self) -> Option<ResolveSettings> {
        if !self.config.ingest.resolve_videos {
            return None;
        }
        let command = self.config.video.resolver_command.clone()?;
        let timeout = self
            .config
            .video
            .resolver_timeout
            .unwrap_or(DEFAULT_RESOLVER_TIMEOUT);
        Some(ResolveSettings {
            command,
            timeout: timeout.as_secs(),
        })
    }

    /// Asset manager for a payload's storage and fetch settings
    pub fn asset_manager(&self, payload: &PayloadConfig) -> Result<AssetManager> {
        let download = payload.download_config(&self.config.download);
        let client = build_http_client(
            &payload.user_agent,
            download.asset_timeout,
            payload.proxy.as_ref(),
        )?;
        Ok(AssetManager::new(client, &payload.storage_root, &payload.user_agent, &download)?
            .with_transcoder(Arc::clone(&self.transcoder))
            .with_header_policy(Arc::clone(&self.headers)))
    }

    /// Breaker for a payload's volume, sharing this context's probe and notifier
    pub fn storage_for(&self, payload: &PayloadConfig) -> StorageMonitor {
        self.storage
            .for_volume(payload.volume_root(), payload.pause_file(), payload.warn_threshold())
    }

    /// Close database handles
    pub async fn close(self) {
        if let Some(store) = self.checkpoint.into_inner()
            && let Some(store) = Arc::into_inner(store)
        {
            store.close().await;
        }
        self.db.pool().close().await;
    }
}
