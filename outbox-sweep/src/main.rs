//! outbox-sweep - Background daemon for scheduled posting
//!
//! Polls the post queue and publishes due content at the scheduled
//! time, respecting monthly platform quotas and timing out work left
//! behind by crashed runs.

use clap::Parser;
use liboutbox::logging::{self, LogFormat};
use liboutbox::scheduler::ConfigClientProvider;
use liboutbox::{Config, Database, OutboxError, Result, Scheduler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "outbox-sweep")]
#[command(version)]
#[command(about = "Background daemon for scheduled posting")]
#[command(long_about = "\
outbox-sweep - Background daemon for scheduled posting

DESCRIPTION:
    outbox-sweep is a long-running daemon that polls the outbox queue
    and publishes scheduled content at the right time.

    Each sweep times out posts stranded by a crashed run, loads due
    posts in order, claims them so concurrent sweeps never double-post,
    and publishes singles and whole threads against X and Bluesky.
    Monthly X quota is enforced before any network traffic.

USAGE:
    # Run in foreground (logs to stderr)
    outbox-sweep

    # Run with custom poll interval
    outbox-sweep --poll-interval 30

    # Single sweep, JSON summary on stdout (for cron)
    outbox-sweep --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current sweep)

CONFIGURATION:
    Configuration file: ~/.config/outbox/config.toml
    Database location: per [database] path in the config

    [database]
    path = \"~/.local/share/outbox/outbox.db\"

    [x]
    enabled = true
    client_id = \"...\"
    client_secret = \"...\"

    [bluesky]
    enabled = true
    identifier = \"alice.example.com\"
    app_password = \"...\"

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Not authenticated
    3 - Invalid input
")]
struct Cli {
    /// Poll interval in seconds
    #[arg(long, value_name = "SECONDS", default_value_t = 60)]
    #[arg(help = "How often to run a sweep (default: 60)")]
    poll_interval: u64,

    /// Run one sweep and exit, printing a JSON summary to stdout
    #[arg(long)]
    once: bool,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    #[arg(help = "Enable verbose logging (useful for debugging)")]
    verbose: bool,

    /// Log output format
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    #[arg(help = "Log format: text or json")]
    log_format: LogFormat,

    /// Minimum log level
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    #[arg(help = "Log level: error, warn, info, debug, trace")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    logging::init(cli.log_format, &cli.log_level, cli.verbose);

    match run(cli).await {
        Ok(()) => {}
        Err(err) => {
            error!("{}", err);
            std::process::exit(err.exit_code());
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;
    let provider = Arc::new(ConfigClientProvider::new(db.clone(), &config)?);
    let scheduler = Scheduler::new(db, provider);

    if cli.once {
        // Emit the JSON summary even when the sweep itself fails, so
        // cron callers always get a parseable line.
        let result = scheduler.sweep(now_epoch()).await;
        let summary = match &result {
            Ok(summary) => summary.clone(),
            Err(err) => liboutbox::SweepSummary {
                error: Some(err.to_string()),
                ..Default::default()
            },
        };
        let json = serde_json::to_string(&summary)
            .map_err(|e| OutboxError::InvalidInput(format!("summary serialization: {}", e)))?;
        println!("{}", json);
        result?;
        return Ok(());
    }

    info!("outbox-sweep daemon starting");

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    info!("Poll interval: {}s", cli.poll_interval);
    run_daemon_loop(&scheduler, cli.poll_interval, shutdown).await?;

    info!("outbox-sweep daemon stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| OutboxError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    // Spawn thread to handle signals
    let shutdown_clone = shutdown.clone();
    std::thread::spawn(move || {
        for sig in signals.forever() {
            match sig {
                SIGTERM | SIGINT => {
                    info!("Received shutdown signal, stopping gracefully...");
                    shutdown_clone.store(true, Ordering::Relaxed);
                    break;
                }
                _ => {}
            }
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(_shutdown: Arc<AtomicBool>) -> Result<()> {
    Ok(())
}

/// Main daemon loop
async fn run_daemon_loop(
    scheduler: &Scheduler,
    poll_interval: u64,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("Shutdown requested, stopping daemon loop");
            break;
        }

        // A failed sweep is logged and retried on the next poll.
        if let Err(e) = scheduler.sweep(now_epoch()).await {
            error!("Sweep failed: {}", e);
        }

        // Sleep until next poll (check shutdown every second)
        for _ in 0..poll_interval {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    Ok(())
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}
