//! # news-ingest
//!
//! Crawl frontier and asset ingestion pipeline for news sites.
//!
//! ## Pipeline
//!
//! - **Frontier** - sitemap walks, paginated category timelines and NDJSON
//!   job logs feed one bounded channel, deduplicated within a run and across
//!   runs by the checkpoint store
//! - **Ingest** - a bounded pool fetches and parses each job, upserts the
//!   article and enqueues one download task
//! - **Worker** - claims tasks from the durable SQLite queue, downloads
//!   images and videos (HLS through ffmpeg) under soft and hard time limits
//! - **Storage breaker** - every stage stops once the active volume crosses
//!   its warning threshold or the pause sentinel exists
//!
//! ## Quick Start
//!
//! ```no_run
//! use news_ingest::{AppContext, Config, IngestRunner, Worker};
//! use news_ingest::sites::{SourceOptions, build_source, get_site};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = Arc::new(AppContext::from_config(Config::default()).await?);
//!     let site = get_site("znews")?;
//!
//!     let runner = IngestRunner::new(Arc::clone(&ctx), site)?;
//!     let source = build_source(site, &ctx.config, reqwest::Client::new(), &SourceOptions::default())?;
//!     let stats = runner.run(source).await?;
//!     println!("{} articles ingested", stats.succeeded);
//!
//!     Worker::new(ctx).run_until_idle().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Media download, probing and HLS transcoding
pub mod assets;
/// Cross-run dedupe store
pub mod checkpoint;
/// Configuration types
pub mod config;
/// Per-process collaborators
pub mod context;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Crawl job sources
pub mod frontier;
/// Crawl loop
pub mod ingest;
/// Durable task queue, worker and storage breaker
pub mod orchestrator;
/// Re-drive of deferred and failed media
pub mod redrive;
/// Retry logic with exponential backoff
pub mod retry;
/// Supported publishers and article parsing
pub mod sites;
/// Core types
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use context::AppContext;
pub use db::Database;
pub use error::{DatabaseError, DownloadError, Error, ErrorKind, FrontierError, Result};
pub use ingest::{IngestRunner, IngestStats};
pub use orchestrator::{StorageMonitor, TaskPayload, TaskQueue, Worker, WorkerStats};
pub use redrive::{RedriveOptions, RedriveStats, redrive};
pub use types::{ArticleId, AssetKind, AssetRef, CrawlJob, FrontierStats, ParsedArticle, StoredAsset};

/// Run a worker until a termination signal arrives or the storage breaker trips
///
/// SIGTERM, SIGINT or ctrl_c stop new claims; the call returns once the tasks
/// already running have finished.
pub async fn run_worker_with_shutdown(worker: &Worker) -> Result<WorkerStats> {
    let token = worker.shutdown_token();
    let watcher = tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_signal() => {
                tracing::info!("Stopping worker after in-flight tasks");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    });

    let result = worker.run().await;
    watcher.abort();
    result
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration fails in some sandboxes; fall back to ctrl_c then
    let (Ok(mut term), Ok(mut int)) = (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) else {
        tracing::warn!("Signal handlers unavailable, waiting for ctrl_c");
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        return;
    };
    let name = tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = int.recv() => "SIGINT",
    };
    tracing::info!(signal = name, "Shutdown requested");
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Cannot listen for ctrl_c, worker runs until the breaker trips");
        std::future::pending::<()>().await;
    }
    tracing::info!(signal = "ctrl_c", "Shutdown requested");
}
