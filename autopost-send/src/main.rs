//! autopost-send - Background daemon for scheduled posting
//!
//! Publishes the oldest pending content folder at every configured time slot
//! and keeps pulling new folders from remote storage when configured.

use anyhow::Context;
use clap::Parser;
use libautopost::logging::LoggingConfig;
use libautopost::publisher::outbox::OutboxPublisher;
use libautopost::{AutopostError, AutopostService, Config, CycleOutcome};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "autopost-send")]
#[command(version)]
#[command(about = "Background daemon that posts content folders at fixed times")]
#[command(long_about = "\
autopost-send - Background daemon for scheduled posting

DESCRIPTION:
    autopost-send watches the content directory and publishes one pending
    folder at each configured time of day. Each folder holds numbered slide
    images (1.jpg, 2.jpg, ... or story_1.jpg, ...) and a caption.txt.

    Posted folders move to <content>/posted, failed ones to <content>/failed.
    On startup the daemon repairs anything a crash left half done.

USAGE:
    # Run in foreground (logs to stderr)
    autopost-send

    # Post the next pending folder once and exit
    autopost-send --once

    # Enable verbose logging
    autopost-send --verbose

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (a post in progress completes)
    SIGHUP          - Reload schedule changes made with autopost-queue

CONFIGURATION:
    Configuration file: ~/.config/autopost/config.toml
    Database location:  ~/.local/share/autopost/autopost.db

    [schedule]
    post_times = [\"09:00\", \"15:00\", \"21:00\"]
    timezone = \"America/Sao_Paulo\"

    [retry]
    max_attempts = 3
    backoff_base = \"30s\"

    Override with environment variables:
        AUTOPOST_CONFIG      - Path to config file
        AUTOPOST_LOG_FORMAT  - text, json or pretty
        AUTOPOST_LOG_LEVEL   - error, warn, info, debug, trace

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration or database error
")]
struct Cli {
    /// Enable verbose logging to stderr
    #[arg(short, long)]
    #[arg(help = "Enable verbose logging (useful for debugging)")]
    verbose: bool,

    /// Run one posting cycle and exit
    #[arg(long)]
    #[arg(help = "Post the next pending folder once and exit")]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<AutopostError>()
            .map(AutopostError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    let publisher = Arc::new(OutboxPublisher::new(config.outbox_dir()));
    let service = Arc::new(AutopostService::new(config, publisher).await?);

    info!("autopost-send daemon starting");
    let report = service.startup().await?;
    info!(
        recovered = report.recovered_posted,
        interrupted = report.interrupted,
        archived = report.archived,
        vanished = report.vanished,
        "Startup reconciliation done"
    );

    if cli.once {
        match service.post_now().await? {
            CycleOutcome::Posted { folder, .. } => info!(folder = %folder.name, "Posted"),
            CycleOutcome::Failed { folder, record } => warn!(
                folder = %folder.name,
                error = record.error_message.as_deref().unwrap_or("unknown"),
                "Posting failed"
            ),
            CycleOutcome::Idle => info!("Nothing pending"),
        }
        return Ok(());
    }

    let status = service.get_status().await?;
    info!(
        slots = ?status.slots,
        timezone = %status.timezone,
        next_run = ?status.next_run,
        pending = status.pending,
        "Scheduler ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signals = spawn_signal_handler(Arc::clone(&service), shutdown_tx)?;

    service.run(shutdown_rx).await;
    signals.abort();

    info!("autopost-send daemon stopped");
    Ok(())
}

/// SIGINT/SIGTERM request shutdown, SIGHUP reloads the persisted schedule
#[cfg(unix)]
fn spawn_signal_handler(
    service: Arc<AutopostService>,
    shutdown: watch::Sender<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    use futures::stream::StreamExt;
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals =
        Signals::new([SIGHUP, SIGINT, SIGTERM]).context("Signal setup failed")?;

    Ok(tokio::spawn(async move {
        while let Some(signal) = signals.next().await {
            match signal {
                SIGHUP => match service.reload().await {
                    Ok(state) => info!(
                        enabled = state.enabled,
                        slots = state.slots.len(),
                        "Schedule reloaded"
                    ),
                    Err(e) => error!(error = %e, "Schedule reload failed"),
                },
                SIGINT | SIGTERM => {
                    info!("Received shutdown signal, stopping gracefully...");
                    let _ = shutdown.send(true);
                    break;
                }
                _ => {}
            }
        }
    }))
}

#[cfg(not(unix))]
fn spawn_signal_handler(
    _service: Arc<AutopostService>,
    shutdown: watch::Sender<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, stopping gracefully...");
            let _ = shutdown.send(true);
        }
    }))
}
