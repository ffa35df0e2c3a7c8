//! Storage operator tooling: usage report, active volume switch, pause sentinel

use clap::{Parser, Subcommand};
use news_ingest::config::update_env_file;
use news_ingest::{Config, Error, Result, StorageMonitor};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt as tfmt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Manage ingest storage volumes")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true, env = "NEWS_INGEST_CONFIG")]
    config: Option<PathBuf>,

    /// `.env` file holding the STORAGE_* settings
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print usage of every volume
    Usage,
    /// Switch STORAGE_ACTIVE_VOLUME in the .env file
    SetActive {
        /// Volume name
        volume: String,
    },
    /// Create the pause sentinel
    Pause {
        /// Recorded in the sentinel
        #[arg(long, default_value = "paused by operator")]
        reason: String,
        /// Override the sentinel path
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Remove the pause sentinel
    Resume {
        /// Override the sentinel path
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt().with_env_filter(filter).with_target(false).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "news-storage failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref(), Some(&cli.env_file))?;
    let storage = &config.storage;

    match cli.command {
        Command::Usage => {
            let active = StorageMonitor::from_config(storage)?;
            let paused = active.is_paused().await;
            for (name, path) in &storage.volumes {
                let monitor = StorageMonitor::new(path, active.pause_file(), active.warn_threshold());
                let usage = match monitor.usage_fraction() {
                    Ok(fraction) => format!("{:.2}% used", fraction * 100.0),
                    Err(e) => format!("usage unavailable ({e})"),
                };
                if *name == storage.active_volume {
                    let status = if paused { "PAUSED" } else { "ACTIVE" };
                    println!(
                        "Volume {name}: {usage} ({status}, threshold {:.0}%) at {}",
                        active.warn_threshold() * 100.0,
                        path.display()
                    );
                } else {
                    println!("Volume {name}: {usage} at {}", path.display());
                }
            }
            Ok(())
        }
        Command::SetActive { volume } => {
            if !storage.volumes.contains_key(&volume) {
                let valid: Vec<&str> = storage.volumes.keys().map(String::as_str).collect();
                return Err(Error::config(
                    "STORAGE_ACTIVE_VOLUME",
                    format!("unknown volume '{volume}'; valid volumes: {}", valid.join(", ")),
                ));
            }
            update_env_file(&cli.env_file, "STORAGE_ACTIVE_VOLUME", &volume)?;
            println!("Active volume set to {volume} in {}", cli.env_file.display());
            Ok(())
        }
        Command::Pause { reason, file } => {
            let monitor = monitor_with_sentinel(&config, file)?;
            monitor.pause(&reason).await?;
            println!("Created pause sentinel at {}", monitor.pause_file().display());
            Ok(())
        }
        Command::Resume { file } => {
            let monitor = monitor_with_sentinel(&config, file)?;
            if monitor.resume().await? {
                println!("Cleared pause sentinel at {}", monitor.pause_file().display());
            } else {
                println!("No pause sentinel at {}", monitor.pause_file().display());
            }
            Ok(())
        }
    }
}

fn monitor_with_sentinel(config: &Config, file: Option<PathBuf>) -> Result<StorageMonitor> {
    let monitor = StorageMonitor::from_config(&config.storage)?;
    Ok(match file {
        Some(file) => monitor.for_volume(monitor.volume_path().to_path_buf(), file, monitor.warn_threshold()),
        None => monitor,
    })
}
