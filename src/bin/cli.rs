//! meterpoll CLI
//!
//! Runs the coordinator against the configured metering API.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;

use meterpoll::{
    barrier::BarrierAttributes,
    config::load_config,
    coordinator::{AccumulatedReading, Coordinator, HistoricalFeed, HistoricalSink, RestoreFn},
    error::{AppError, Result},
    models::{Config, DatasetKind, HistoricalReading, Snapshot},
    utils::log::Logger,
};

/// meterpoll - gated polling of a rate-limited metering API
#[derive(Parser, Debug)]
#[command(name = "meterpoll", version, about = "Gated metering API poller")]
struct Cli {
    /// Configuration file (default: ./meterpoll.toml or $METERPOLL_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll until interrupted
    Run {
        /// Comma separated datasets to keep fresh
        #[arg(long, default_value = "all")]
        datasets: String,

        /// JSON file the last snapshot is restored from and saved to
        #[arg(long)]
        state: Option<PathBuf>,
    },

    /// Run a single tick and print the result as JSON
    Once {
        /// Comma separated datasets to request
        #[arg(long, default_value = "all")]
        datasets: String,

        /// Bypass the barriers of the requested datasets
        #[arg(long)]
        force: bool,
    },

    /// Validate the configuration file
    Validate,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool, config: &Config) {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn parse_datasets(list: &str) -> Result<DatasetKind> {
    DatasetKind::parse_list(list)
        .filter(|kinds| !kinds.is_empty())
        .ok_or_else(|| AppError::validation(format!("invalid dataset list: {list}")))
}

/// Writes forwarded historical readings to the log.
struct LogSink;

impl HistoricalSink for LogSink {
    fn write(&self, kind: DatasetKind, readings: &[HistoricalReading]) {
        for reading in readings {
            log::info!(
                "{}: {} - {}: {} Wh",
                kind.name(),
                reading.start,
                reading.end,
                reading.value
            );
        }
    }
}

fn read_state(path: &Path) -> Option<Snapshot> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            log::warn!("Ignoring unreadable state file {}: {}", path.display(), e);
            None
        }
    }
}

fn restore_from(state: Option<PathBuf>) -> RestoreFn {
    Box::new(move || {
        state
            .as_deref()
            .and_then(read_state)
            .and_then(|snapshot| snapshot.measure_accumulated)
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Cannot listen for Ctrl-C: {}", e);
    }
}

#[derive(Serialize)]
struct OnceReport<'a> {
    updated: String,
    last_tick_succeeded: bool,
    snapshot: &'a Snapshot,
    barriers: std::collections::BTreeMap<&'static str, BarrierAttributes>,
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_logging(cli.verbose, &config);

    match cli.config.as_deref() {
        Some(path) => log::debug!("Configuration: {}", path.display()),
        None => log::debug!("Configuration: default location"),
    }

    let log = Logger::default();

    match cli.command {
        Command::Run { datasets, state } => {
            let kinds = parse_datasets(&datasets)?;
            let coordinator = Coordinator::from_config(&config, &log)?;

            if kinds.contains(DatasetKind::MEASURE) {
                let reading = Arc::new(AccumulatedReading::restore(
                    restore_from(state.clone()),
                    &log.child("measure"),
                ));
                if reading.needs_bootstrap() {
                    log::info!("No previous measure, forcing the first fetch");
                    coordinator.force_refresh(DatasetKind::MEASURE);
                }
                coordinator.register_listener(DatasetKind::MEASURE, reading);
            }
            if kinds.contains(DatasetKind::HISTORICAL_CONSUMPTION) {
                let feed =
                    HistoricalFeed::consumption(LogSink, log.child("historical_consumption"));
                coordinator.register_listener(feed.kind(), Arc::new(feed));
            }
            if kinds.contains(DatasetKind::HISTORICAL_GENERATION) {
                let feed =
                    HistoricalFeed::generation(LogSink, log.child("historical_generation"));
                coordinator.register_listener(feed.kind(), Arc::new(feed));
            }
            if kinds.contains(DatasetKind::HISTORICAL_POWER_DEMAND) {
                coordinator.register_consumer(DatasetKind::HISTORICAL_POWER_DEMAND);
            }

            log::info!("meterpoll starting, keeping {} fresh", kinds);
            coordinator.run(shutdown_signal()).await;

            if let Some(path) = state {
                let json = serde_json::to_string_pretty(coordinator.latest().snapshot.as_ref())?;
                std::fs::write(&path, json)?;
                log::info!("State saved to {}", path.display());
            }
        }

        Command::Once { datasets, force } => {
            let kinds = parse_datasets(&datasets)?;
            let coordinator = Coordinator::from_config(&config, &log)?;
            coordinator.register_consumer(kinds);
            if force {
                coordinator.force_refresh(kinds);
            }

            let published = coordinator.tick().await;
            let report = OnceReport {
                updated: published.updated.to_string(),
                last_tick_succeeded: published.last_tick_succeeded,
                snapshot: published.snapshot.as_ref(),
                barriers: coordinator.barrier_attributes(Utc::now()).await,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::Validate => {
            log::info!("Validating configuration...");
            config.build_barriers(&log)?;
            for (name, policy) in &config.barriers {
                log::info!("✓ {}: {:?}", name, policy);
            }
            log::info!("All validations passed!");
        }
    }

    Ok(())
}
