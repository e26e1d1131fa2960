//! synd-worker - Background daemon executing publish jobs
//!
//! Runs a worker pool against the shared queue until interrupted. Several
//! daemons may serve the same database; claims and quotas are coordinated
//! through the store.

use clap::Parser;
use libsyndicate::clock::{Clock, SystemClock};
use libsyndicate::config::resolve_config_path;
use libsyndicate::logging::LoggingConfig;
use libsyndicate::platforms::mock::MockAdapter;
use libsyndicate::platforms::AdapterRegistry;
use libsyndicate::{Config, Platform, Result, SyndicateError, SyndicateService};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "synd-worker")]
#[command(version)]
#[command(about = "Background daemon executing publish jobs")]
#[command(long_about = "\
synd-worker - Background daemon executing publish jobs

DESCRIPTION:
    synd-worker runs a pool of workers that pick the next due account per
    platform with the fair-share scheduler and publish its earliest due job,
    respecting rate limits and circuit breakers. A maintenance task purges
    expired rate-limit entries, recovers jobs orphaned by crashed workers
    and reports starved accounts.

    Platform adapters are provided by the embedding application. With
    --dry-run every platform is served by a mock adapter that accepts all
    posts, which exercises scheduling end to end without publishing.

USAGE:
    # Run in foreground (logs to stderr)
    synd-worker --dry-run

    # Drain whatever is due once and exit
    synd-worker --dry-run --once

    # JSON logs for a log pipeline
    SYNDICATE_LOG_FORMAT=json synd-worker --dry-run

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes in-flight jobs)

CONFIGURATION:
    Configuration file: ~/.config/syndicate/config.toml

    [worker]
    workers = 4               # concurrent worker tasks
    poll_interval_ms = 5000   # idle sleep between scheduling rounds
    stale_after_seconds = 1800

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
    3 - Invalid invocation
")]
struct Cli {
    /// Number of worker tasks (overrides config)
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Idle poll interval in milliseconds (overrides config)
    #[arg(long, value_name = "MS")]
    poll_interval: Option<u64>,

    /// Serve every platform with a mock adapter
    #[arg(long)]
    dry_run: bool,

    /// Process due jobs until idle, run maintenance once and exit
    #[arg(long)]
    once: bool,

    /// Upper bound on scheduling rounds with --once
    #[arg(long, default_value_t = 1000, requires = "once")]
    max_rounds: usize,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env();
    logging.verbose = cli.verbose;
    logging.init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config()?;
    if let Some(workers) = cli.workers {
        config.worker.workers = workers;
    }
    if let Some(poll_interval) = cli.poll_interval {
        config.worker.poll_interval_ms = poll_interval;
    }
    config.validate()?;

    let adapters = if cli.dry_run {
        dry_run_adapters()
    } else {
        AdapterRegistry::new()
    };
    if adapters.is_empty() {
        return Err(SyndicateError::InvalidInput(
            "No platform adapters registered; use --dry-run or embed libsyndicate with your adapters"
                .to_string(),
        ));
    }

    let service = SyndicateService::from_config(config, adapters).await?;
    let pool = service.worker_pool()?;

    info!(
        workers = pool.settings().workers,
        dry_run = cli.dry_run,
        "synd-worker starting"
    );

    if cli.once {
        let attempts = pool.run_until_idle(cli.max_rounds).await?;
        let report = pool.run_maintenance(SystemClock.now_ms()).await?;
        info!(
            attempts,
            recovered = report.recovered_jobs,
            starved = report.starved_tokens.len(),
            "Processed due jobs once, exiting"
        );
        println!("{} job attempt(s) processed", attempts);
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;
    pool.start(shutdown).await?;

    info!("synd-worker stopped");
    Ok(())
}

/// Configured file when present, built-in defaults otherwise
fn load_config() -> Result<Config> {
    let path = resolve_config_path()?;
    if path.exists() {
        Config::load_from_path(&path)
    } else {
        Ok(Config::default_config())
    }
}

fn dry_run_adapters() -> AdapterRegistry {
    let mut adapters = AdapterRegistry::new();
    for platform in Platform::ALL {
        adapters.register(Arc::new(MockAdapter::new(platform)));
    }
    adapters
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|e| {
        SyndicateError::InvalidInput(format!("Signal setup failed: {}", e))
    })?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!(signal = sig, "Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
    Ok(())
}
