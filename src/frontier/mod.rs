//! Frontier sources
//!
//! A frontier source discovers article URLs and hands them to the crawl loop
//! as [`CrawlJob`]s. Every source runs on its own tokio task and pushes onto a
//! bounded channel ([`spawn`]); the consumer pulls until the channel closes,
//! and dropping the receiver stops the producer at its next send.
//!
//! All sources share one admission gate ([`JobSink`]) so they agree on:
//! - a URL is emitted at most once per run (by canonical form)
//! - with `resume`, URLs in the caller's already-ingested set are skipped
//! - with a checkpoint store, URLs that are neither new nor changed are skipped
//! - [`FrontierStats`] are counted the same way
//!
//! ## Submodules
//!
//! - [`sitemap`] - sitemap index walker
//! - [`category`] - paginated category crawler
//! - [`ndjson`] - NDJSON job log replay and writer
//! - [`fetch`] - page fetcher with retry shared by the network sources

use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::error::FrontierError;
use crate::types::{CrawlJob, FrontierStats};
use crate::utils::canonicalize_url;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod category;
pub mod fetch;
pub mod ndjson;
pub mod sitemap;

pub use category::{CategoryDefinition, CategoryLimits, CategorySource};
pub use fetch::PageFetcher;
pub use ndjson::{NdjsonJobWriter, NdjsonSource};
pub use sitemap::{SitemapLimits, SitemapSource};

/// A strategy that discovers crawl jobs
///
/// `produce` runs one full iteration. It may be called again on the same
/// source for another run; each run gets a fresh [`JobSink`], so the seen set
/// and stats start empty.
#[async_trait]
pub trait FrontierSource: Send {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Offer every discovered job to `sink`
    ///
    /// Returns `Err(FrontierError::ConsumerClosed)` (via `?` on
    /// [`JobSink::offer`]) when the consumer went away.
    async fn produce(&mut self, sink: &mut JobSink) -> Result<()>;
}

#[async_trait]
impl<S: FrontierSource + ?Sized> FrontierSource for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn produce(&mut self, sink: &mut JobSink) -> Result<()> {
        (**self).produce(sink).await
    }
}

/// Caller-supplied admission rules shared by every source
#[derive(Clone, Default)]
pub struct EmitPolicy {
    /// Skip URLs present in `existing`
    pub resume: bool,
    /// Canonical URLs already ingested
    pub existing: Arc<HashSet<String>>,
    /// Cross-run dedupe store
    pub checkpoint: Option<Arc<CheckpointStore>>,
    /// Only consult the checkpoint on emit; the consumer records each job
    /// once it has been handled
    pub deferred_commit: bool,
}

impl EmitPolicy {
    /// Policy with a resume set built from raw URLs
    pub fn resume_from<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let existing = urls
            .into_iter()
            .filter_map(|u| canonicalize_url(u.as_ref()))
            .collect();
        Self {
            resume: true,
            existing: Arc::new(existing),
            ..Self::default()
        }
    }

    /// Attach a checkpoint store
    pub fn with_checkpoint(mut self, store: Arc<CheckpointStore>) -> Self {
        self.checkpoint = Some(store);
        self
    }

    /// Leave checkpoint writes to the consumer
    ///
    /// Jobs still buffered when the consumer stops are then offered again by
    /// the next run.
    pub fn with_deferred_commit(mut self) -> Self {
        self.deferred_commit = true;
        self
    }
}

/// Outcome of offering one candidate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Offer {
    /// Sent to the consumer
    Emitted,
    /// Already emitted in this run
    Duplicate,
    /// Already ingested, or unchanged in the checkpoint store
    Existing,
    /// Not a usable URL
    Invalid,
}

/// Admission gate and channel sender for one run
pub struct JobSink {
    tx: mpsc::Sender<CrawlJob>,
    policy: EmitPolicy,
    seen: HashSet<String>,
    stats: FrontierStats,
}

impl JobSink {
    fn new(tx: mpsc::Sender<CrawlJob>, policy: EmitPolicy) -> Self {
        Self {
            tx,
            policy,
            seen: HashSet::new(),
            stats: FrontierStats::default(),
        }
    }

    /// Run a candidate through the gate and send it if admitted
    pub async fn offer(&mut self, mut job: CrawlJob) -> Result<Offer> {
        self.stats.total += 1;

        let Some(canonical) = canonicalize_url(&job.url) else {
            self.stats.skipped_invalid += 1;
            tracing::debug!(url = %job.url, "Skipping invalid URL");
            return Ok(Offer::Invalid);
        };

        if !self.seen.insert(canonical.clone()) {
            self.stats.skipped_duplicate += 1;
            return Ok(Offer::Duplicate);
        }

        if self.policy.resume && self.policy.existing.contains(&canonical) {
            self.stats.skipped_existing += 1;
            return Ok(Offer::Existing);
        }

        job.url = canonical;

        // Reserve the slot first so a closed consumer never gets checkpointed URLs
        let permit = self
            .tx
            .reserve()
            .await
            .map_err(|_| Error::Frontier(FrontierError::ConsumerClosed))?;

        if let Some(store) = &self.policy.checkpoint {
            let record = CheckpointRecord::from(&job);
            let fresh = if self.policy.deferred_commit {
                store.is_changed(&record).await?
            } else {
                store.upsert(&record).await?
            };
            if !fresh {
                self.stats.skipped_existing += 1;
                return Ok(Offer::Existing);
            }
        }

        permit.send(job);
        self.stats.emitted += 1;
        Ok(Offer::Emitted)
    }

    /// Count an unparseable candidate
    pub fn reject_invalid(&mut self) {
        self.stats.total += 1;
        self.stats.skipped_invalid += 1;
    }

    /// Count a candidate that carries nothing (blank log line)
    pub fn count_blank(&mut self) {
        self.stats.total += 1;
    }

    /// Counters so far
    pub fn stats(&self) -> FrontierStats {
        self.stats
    }

    /// Whether the consumer dropped its receiver
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// What a finished run hands back
pub struct FrontierOutcome<S> {
    /// The source, ready for another run
    pub source: S,
    /// Final counters
    pub stats: FrontierStats,
    /// Whether the consumer stopped the run early
    pub cancelled: bool,
}

/// Receiving end of a running source
pub struct FrontierHandle<S> {
    jobs: mpsc::Receiver<CrawlJob>,
    task: JoinHandle<(S, FrontierStats, Result<()>)>,
}

impl<S> FrontierHandle<S> {
    /// Next job, or `None` once the source is exhausted
    pub async fn recv(&mut self) -> Option<CrawlJob> {
        self.jobs.recv().await
    }

    /// Stop pulling, wait for the producer and return its outcome
    ///
    /// Jobs still buffered in the channel are discarded.
    pub async fn finish(self) -> Result<FrontierOutcome<S>> {
        let FrontierHandle { jobs, task } = self;
        drop(jobs);

        let (source, stats, result) = task
            .await
            .map_err(|e| Error::Other(format!("frontier task failed: {e}")))?;

        match result {
            Ok(()) => Ok(FrontierOutcome {
                source,
                stats,
                cancelled: false,
            }),
            Err(Error::Frontier(FrontierError::ConsumerClosed)) => Ok(FrontierOutcome {
                source,
                stats,
                cancelled: true,
            }),
            Err(e) => Err(e),
        }
    }
}

/// Run `source` on a tokio task feeding a channel of `capacity` jobs
pub fn spawn<S>(mut source: S, policy: EmitPolicy, capacity: usize) -> FrontierHandle<S>
where
    S: FrontierSource + 'static,
{
    let (tx, jobs) = mpsc::channel(capacity.max(1));

    let task = tokio::spawn(async move {
        let mut sink = JobSink::new(tx, policy);
        tracing::info!(source = source.name(), "Frontier run started");

        let result = source.produce(&mut sink).await;
        let stats = sink.stats();

        match &result {
            Ok(()) => tracing::info!(
                source = source.name(),
                total = stats.total,
                emitted = stats.emitted,
                skipped_existing = stats.skipped_existing,
                skipped_duplicate = stats.skipped_duplicate,
                skipped_invalid = stats.skipped_invalid,
                "Frontier run complete"
            ),
            Err(Error::Frontier(FrontierError::ConsumerClosed)) => {
                tracing::info!(source = source.name(), emitted = stats.emitted, "Frontier run cancelled by consumer")
            }
            Err(e) => tracing::error!(source = source.name(), error = %e, "Frontier run failed"),
        }

        (source, stats, result)
    });

    FrontierHandle { jobs, task }
}

/// Drain a whole run into memory
pub async fn collect<S>(source: S, policy: EmitPolicy) -> Result<(Vec<CrawlJob>, FrontierOutcome<S>)>
where
    S: FrontierSource + 'static,
{
    let mut handle = spawn(source, policy, 64);
    let mut jobs = Vec::new();
    while let Some(job) = handle.recv().await {
        jobs.push(job);
    }
    let outcome = handle.finish().await?;
    Ok((jobs, outcome))
}
