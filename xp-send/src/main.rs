//! xp-send - Worker daemon for scheduled publishing
//!
//! Runs a pool of publish workers against the configured queue and sweeps
//! `scheduled` posts that never reached the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use libcrosspost::logging::LoggingConfig;
use libcrosspost::service::CrosspostService;
use libcrosspost::worker::JobOutcome;
use libcrosspost::{Config, CrosspostError, Result};
use tokio::time::{sleep, Duration};
use tracing::{error, info};

/// Posts picked up per awaiting-enqueue sweep
const SWEEP_BATCH: usize = 100;

#[derive(Parser, Debug)]
#[command(name = "xp-send")]
#[command(version)]
#[command(about = "Worker daemon for scheduled publishing")]
#[command(long_about = "\
xp-send - Worker daemon for scheduled publishing

DESCRIPTION:
    xp-send runs the publish workers. Each worker leases the next due job
    from the queue, refreshes the owner's access tokens if needed, publishes
    to every requested platform and records the outcome on the post.

    Failed attempts are retried with exponential backoff until the attempt
    cap is reached, after which the post is marked failed.

    On every poll tick xp-send also enqueues scheduled posts that were saved
    while the queue was unavailable.

USAGE:
    # Run in foreground (logs to stderr)
    xp-send

    # Four workers, polling every 5 seconds when idle
    xp-send --concurrency 4 --poll-interval 5

    # Drain everything that is due, then exit
    xp-send --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (in-flight publishes finish first)

CONFIGURATION:
    Configuration file: ~/.config/crosspost/config.toml

    [queue]
    backend = \"sqlite\"        # sqlite, memory or disabled
    concurrency = 4
    max_attempts = 3
    backoff_base_secs = 5
    poll_interval_secs = 5

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Number of concurrent workers (overrides config)
    #[arg(short, long, value_name = "N")]
    concurrency: Option<usize>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Process everything that is due once and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run(cli).await {
        error!(error = %e, "xp-send stopped with an error");
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(secs) = cli.poll_interval {
        config.queue.poll_interval_secs = secs;
    }
    if let Some(n) = cli.concurrency {
        if n == 0 {
            return Err(CrosspostError::InvalidInput(
                "--concurrency must be at least 1".to_string(),
            ));
        }
        config.queue.concurrency = n;
    }

    let service = CrosspostService::from_config(config).await?;

    if cli.once {
        let processed = drain_once(&service).await?;
        info!(processed, "xp-send: processed due jobs once, exiting");
        return Ok(());
    }

    info!(
        concurrency = service.config().queue.concurrency,
        poll_interval_secs = service.config().queue.poll_interval_secs,
        "xp-send daemon starting"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let workers = service.spawn_workers()?;
    run_sweep_loop(&service, shutdown).await;

    info!(workers = workers.len(), "Waiting for in-flight publishes");
    workers.shutdown_and_join().await;
    info!("xp-send daemon stopped");
    Ok(())
}

/// Sweep once, then run a single worker until nothing is due
async fn drain_once(service: &CrosspostService) -> Result<usize> {
    service.schedule().enqueue_pending(SWEEP_BATCH).await?;

    let worker = service.worker()?;
    let mut processed = 0;
    loop {
        match worker.run_once().await? {
            JobOutcome::Idle => break,
            outcome => {
                info!(?outcome, "Processed job");
                processed += 1;
            }
        }
    }
    Ok(processed)
}

async fn run_sweep_loop(service: &CrosspostService, shutdown: Arc<AtomicBool>) {
    let poll_interval = service.config().queue.poll_interval_secs.max(1);
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("Shutdown requested, stopping sweep loop");
            break;
        }

        if let Err(e) = service.schedule().enqueue_pending(SWEEP_BATCH).await {
            error!(error = %e, "Awaiting-enqueue sweep failed");
        }

        // Sleep until next tick (check shutdown every second)
        for _ in 0..poll_interval {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| CrosspostError::InvalidInput(format!("Signal setup failed: {}", e)))?;

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
