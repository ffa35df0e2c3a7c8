//! Crawl, download worker and re-drive entry point

use clap::{Args, Parser, Subcommand};
use news_ingest::db::MediaFilter;
use news_ingest::sites::{SourceOptions, build_source, get_site, list_sites, load_categories};
use news_ingest::utils::build_http_client;
use news_ingest::{
    AppContext, Config, IngestRunner, RedriveOptions, Result, Worker, redrive, run_worker_with_shutdown,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt as tfmt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Crawl news sites and download their media")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true, env = "NEWS_INGEST_CONFIG")]
    config: Option<PathBuf>,

    /// `.env` file overlaid before the process environment
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover articles for a site, store them and queue their downloads
    Crawl(CrawlArgs),
    /// Process queued download tasks
    Worker {
        /// Exit once no task is due instead of polling
        #[arg(long)]
        once: bool,
        /// Parallel claim loops (overrides worker.concurrency)
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Queue downloads for deferred videos and failed media
    Redrive {
        /// Re-drive pending failed downloads
        #[arg(long)]
        include_failed: bool,
        /// Re-drive deferred videos whose category is now enabled
        #[arg(long)]
        include_deferred: bool,
        /// Only this site
        #[arg(long)]
        site: Option<String>,
        /// At most this many rows of each kind
        #[arg(long)]
        limit: Option<i64>,
    },
}

#[derive(Args, Debug)]
struct CrawlArgs {
    /// Site slug
    #[arg(long)]
    site: String,
    /// Replay an NDJSON job log instead of crawling
    #[arg(long)]
    jobs_file: Option<PathBuf>,
    /// Skip URLs already stored as articles
    #[arg(long)]
    resume: bool,
    /// Parallel fetch+parse tasks (overrides ingest.max_workers)
    #[arg(long)]
    workers: Option<usize>,
    /// JSON file of category definitions replacing the built-in catalogue
    #[arg(long)]
    categories: Option<PathBuf>,
    /// Only crawl these category slugs (comma separated)
    #[arg(long, value_delimiter = ',')]
    category: Vec<String>,
    /// Keep fetched HTML next to the article's media
    #[arg(long)]
    raw_html_cache: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt().with_env_filter(filter).with_target(true).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(kind = %e.kind(), error = %e, "news-ingest failed");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let mut config = Config::load(cli.config.as_deref(), Some(&cli.env_file))?;

    match cli.command {
        Command::Crawl(args) => crawl(config, args).await,
        Command::Worker { once, concurrency } => {
            if let Some(concurrency) = concurrency {
                config.worker.concurrency = concurrency;
            }
            let ctx = Arc::new(AppContext::from_config(config).await?);
            let worker = Worker::new(Arc::clone(&ctx));
            let stats = if once {
                worker.run_until_idle().await?
            } else {
                run_worker_with_shutdown(&worker).await?
            };
            drop(worker);
            close(ctx).await;
            if stats.paused {
                tracing::warn!("Worker stopped by the storage breaker");
            }
            Ok(0)
        }
        Command::Redrive {
            include_failed,
            include_deferred,
            site,
            limit,
        } => {
            // Neither flag means both
            let both = !include_failed && !include_deferred;
            let options = RedriveOptions {
                include_failed: include_failed || both,
                include_deferred: include_deferred || both,
                filter: MediaFilter {
                    site_slug: site,
                    article_id: None,
                    limit,
                },
            };
            let ctx = Arc::new(AppContext::from_config(config).await?);
            let stats = redrive(&ctx, &options).await?;
            println!(
                "Re-drive: {} tasks for {} articles ({} assets), {} already stored, {} blocked by policy",
                stats.enqueued_tasks, stats.articles, stats.assets, stats.skipped_stored, stats.skipped_policy
            );
            close(ctx).await;
            Ok(0)
        }
    }
}

async fn crawl(mut config: Config, args: CrawlArgs) -> Result<u8> {
    let site = get_site(&args.site).inspect_err(|_| {
        tracing::error!(supported = %list_sites().join(", "), "Unknown site");
    })?;

    if args.resume {
        config.frontier.resume = true;
    }
    if let Some(workers) = args.workers {
        config.ingest.max_workers = workers;
    }
    if args.raw_html_cache {
        config.ingest.raw_html_cache = true;
    }

    let categories = match &args.categories {
        Some(path) => Some(load_categories(path).await?),
        None => None,
    };

    let ctx = Arc::new(AppContext::from_config(config).await?);
    let client = build_http_client(
        site.user_agent(&ctx.config),
        ctx.config.frontier.request_timeout,
        ctx.config.proxy.as_ref(),
    )?;
    let source = build_source(
        site,
        &ctx.config,
        client,
        &SourceOptions {
            jobs_file: args.jobs_file.clone(),
            categories,
            only_categories: args.category,
        },
    )?;

    let mut runner = IngestRunner::new(Arc::clone(&ctx), site)?;
    if args.jobs_file.is_none() {
        runner = runner.with_job_log(site.default_jobs_file());
    }
    let stats = runner.run(source).await?;
    drop(runner);

    println!(
        "Processed {} jobs for {}: {} succeeded, {} failed, {} skipped{}",
        stats.processed,
        site.slug,
        stats.succeeded,
        stats.failed,
        stats.skipped,
        if stats.paused { " (storage paused)" } else { "" }
    );
    close(ctx).await;
    Ok(u8::try_from(stats.exit_code()).unwrap_or(1))
}

async fn close(ctx: Arc<AppContext>) {
    if let Some(ctx) = Arc::into_inner(ctx) {
        ctx.close().await;
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crawl_flags_parse() {
        let cli = Cli::parse_from([
            "news-ingest",
            "crawl",
            "--site",
            "thanhnien",
            "--resume",
            "--workers",
            "8",
            "--category",
            "thoi-su,kinh-te",
        ]);
        let Command::Crawl(args) = cli.command else {
            panic!("expected crawl");
        };
        assert_eq!(args.site, "thanhnien");
        assert!(args.resume);
        assert_eq!(args.workers, Some(8));
        assert_eq!(args.category, vec!["thoi-su", "kinh-te"]);
        assert_eq!(cli.env_file, PathBuf::from(".env"));
    }

    #[test]
    fn worker_and_redrive_flags_parse() {
        let cli = Cli::parse_from(["news-ingest", "--config", "ingest.json", "worker", "--once"]);
        assert_eq!(cli.config, Some(PathBuf::from("ingest.json")));
        assert!(matches!(cli.command, Command::Worker { once: true, concurrency: None }));

        let cli = Cli::parse_from(["news-ingest", "redrive", "--include-deferred", "--site", "znews"]);
        let Command::Redrive {
            include_failed,
            include_deferred,
            site,
            ..
        } = cli.command
        else {
            panic!("expected redrive");
        };
        assert!(!include_failed);
        assert!(include_deferred);
        assert_eq!(site.as_deref(), Some("znews"));
    }
}
