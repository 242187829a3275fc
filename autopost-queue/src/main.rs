//! autopost-queue - Inspect and control the posting pipeline
//!
//! Unix-style tool for the content queue, the posting schedule and history.

use anyhow::anyhow;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use libautopost::logging::LoggingConfig;
use libautopost::publisher::outbox::OutboxPublisher;
use libautopost::types::{HistoryEntry, SchedulerState};
use libautopost::{AutopostError, AutopostService, Config, ContentFolder, CycleOutcome};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "autopost-queue")]
#[command(version)]
#[command(about = "Inspect and control scheduled posting")]
#[command(long_about = "\
autopost-queue - Inspect and control scheduled posting

DESCRIPTION:
    autopost-queue shows what is waiting to be posted, what was posted, and
    changes the posting schedule. Schedule changes are stored immediately;
    send SIGHUP to a running autopost-send to apply them without a restart.

COMMANDS:
    status      Scheduler state, next slot and queue size
    pending     Folders waiting to be posted, in posting order
    history     Recent posting attempts
    stats       Posting totals
    now         Post the next pending folder immediately
    post        Post a specific folder immediately
    sync        Pull new folders from the remote source
    cleanup     Delete old posted folders from the archive
    reset       Restore the schedule from the config file
    retry       Send a failed folder back to the queue
    slots       Replace, add or remove posting times
    enable      Resume automatic posting
    disable     Pause automatic posting (times are kept)
    reconcile   Repair state after a crash (run with the daemon stopped)

USAGE EXAMPLES:
    # What is next?
    autopost-queue status

    # Pending folders as JSON
    autopost-queue pending --format json

    # Post at 08:30 and 19:00 from now on
    autopost-queue slots set 08:30 19:00

    # Retry a folder that failed
    autopost-queue retry <FOLDER_ID>

CONFIGURATION:
    Configuration file: ~/.config/autopost/config.toml
    Database location:  ~/.local/share/autopost/autopost.db

    Override with environment variables:
        AUTOPOST_CONFIG    - Path to config file

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Database or configuration error
    3 - Invalid input (bad time, unknown folder, etc.)
    4 - A posting cycle is already running
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format: text or json
    #[arg(short, long, global = true, default_value = "text")]
    format: String,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    #[arg(help = "Enable verbose logging to stderr (useful for debugging)")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show scheduler state, next slot and queue size
    Status,

    /// List pending folders in posting order
    Pending,

    /// Show recent posting attempts
    History {
        /// Number of entries to show
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },

    /// Show posting totals
    Stats,

    /// Post the next pending folder now
    Now,

    /// Post a specific folder now
    Post {
        /// Folder path, absolute or relative to the content directory
        folder: PathBuf,
    },

    /// Pull new folders from the remote source
    Sync,

    /// Delete posted folders older than the retention period
    Cleanup {
        /// Retention in days (defaults to cleanup.retention_days)
        #[arg(short, long)]
        days: Option<u32>,
    },

    /// Restore the schedule from configuration and lift a suspension
    Reset,

    /// Move a failed folder back to the queue
    Retry {
        /// Folder ID (see `history` or `pending --format json`)
        folder_id: String,
    },

    /// Change posting times
    Slots {
        #[command(subcommand)]
        action: SlotAction,
    },

    /// Resume automatic posting
    Enable,

    /// Pause automatic posting, keeping the configured times
    Disable,

    /// Repair state left by a crash (run with the daemon stopped)
    Reconcile,
}

#[derive(Subcommand, Debug)]
enum SlotAction {
    /// Replace all posting times
    Set {
        /// Times of day as HH:MM
        #[arg(required = true)]
        times: Vec<String>,
    },
    /// Add one posting time
    Add { time: String },
    /// Remove one posting time
    Remove { time: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Text,
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env(cli.verbose);
    if !cli.verbose && std::env::var(libautopost::logging::LOG_LEVEL_ENV).is_err() {
        logging.level = "error".to_string();
    }
    logging.init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<AutopostError>()
            .map(AutopostError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

fn parse_format(format: &str) -> Result<Format, AutopostError> {
    match format {
        "text" => Ok(Format::Text),
        "json" => Ok(Format::Json),
        other => Err(AutopostError::InvalidInput(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            other
        ))),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let format = parse_format(&cli.format)?;

    let config = Config::load()?;
    let publisher = Arc::new(OutboxPublisher::new(config.outbox_dir()));
    let service = AutopostService::new(config, publisher).await?;
    let tz = service.scheduler().timezone();

    match cli.command {
        Commands::Status => cmd_status(&service, format, tz).await,
        Commands::Pending => {
            let pending = service.get_pending().await?;
            output(format, &pending, || print_folders(&pending, tz))
        }
        Commands::History { limit } => {
            let history = service.get_history(limit).await?;
            output(format, &history, || print_history(&history, tz))
        }
        Commands::Stats => {
            let stats = service.stats().await?;
            output(format, &stats, || {
                println!("Posted:          {}", stats.total_success);
                println!("Failed:          {}", stats.total_failure);
                println!("Last 24 hours:   {}", stats.posted_today);
                println!("Last 7 days:     {}", stats.posted_last_7_days);
            })
        }
        Commands::Now => {
            let outcome = service.post_now().await?;
            report_outcome(format, &outcome)
        }
        Commands::Post { folder } => {
            let outcome = service.post_folder(&folder).await?;
            report_outcome(format, &outcome)
        }
        Commands::Sync => {
            let downloaded = service.sync_remote().await?;
            output(format, &downloaded, || {
                if downloaded.is_empty() {
                    println!("No new remote folders");
                }
                for folder in &downloaded {
                    println!("Downloaded {}", folder.name);
                }
            })
        }
        Commands::Cleanup { days } => {
            let removed = service.cleanup(days).await?;
            output(format, &removed, || {
                for folder in &removed {
                    println!("Removed {}", folder.path.display());
                }
                println!("{} folder(s) removed", removed.len());
            })
        }
        Commands::Reset => {
            let state = service.reset().await?;
            print_schedule(format, &state, tz)
        }
        Commands::Retry { folder_id } => {
            let folder = service.reset_folder(&folder_id).await?;
            output(format, &folder, || {
                println!("{} is pending again", folder.name)
            })
        }
        Commands::Slots { action } => {
            let state = match action {
                SlotAction::Set { times } => service.update_slots(times.as_slice()).await?,
                SlotAction::Add { time } => service.add_slot(&time).await?,
                SlotAction::Remove { time } => service.remove_slot(&time).await?,
            };
            print_schedule(format, &state, tz)
        }
        Commands::Enable => {
            let state = service.toggle(true).await?;
            print_schedule(format, &state, tz)
        }
        Commands::Disable => {
            let state = service.toggle(false).await?;
            print_schedule(format, &state, tz)
        }
        Commands::Reconcile => {
            let report = service.reconcile().await?;
            output(format, &report, || {
                println!("Recovered as posted: {}", report.recovered_posted);
                println!("Marked interrupted:  {}", report.interrupted);
                println!("Moved to archive:    {}", report.archived);
                println!("Vanished:            {}", report.vanished);
            })
        }
    }
}

/// Print `value` as JSON, or run `text` for human-readable output
fn output<T: Serialize + ?Sized>(format: Format, value: &T, text: impl FnOnce()) -> anyhow::Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Format::Text => text(),
    }
    Ok(())
}

async fn cmd_status(service: &AutopostService, format: Format, tz: Tz) -> anyhow::Result<()> {
    let status = service.get_status().await?;
    let sync = service.sync_status().await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Remote status unavailable");
        None
    });

    if format == Format::Json {
        let mut json = serde_json::to_value(&status)?;
        json["remote"] = serde_json::to_value(&sync)?;
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    let scheduler = match (&status.suspended, status.enabled) {
        (Some(reason), _) => format!("suspended ({})", reason),
        (None, true) => "enabled".to_string(),
        (None, false) => "disabled".to_string(),
    };
    println!("Scheduler:  {}", scheduler);
    println!("Slots:      {} ({})", status.slots.join(", "), status.timezone);
    println!("Next run:   {}", format_time(status.next_run, tz));
    println!("Last run:   {}", format_time(status.last_run, tz));
    println!("Pending:    {}", status.pending);
    match sync {
        Some(sync) => println!(
            "Remote:     {} folder(s), {} downloaded, {} new",
            sync.remote_count,
            sync.materialized_count,
            sync.pending.len()
        ),
        None => println!("Remote:     not configured"),
    }
    Ok(())
}

fn report_outcome(format: Format, outcome: &CycleOutcome) -> anyhow::Result<()> {
    output(format, outcome, || match outcome {
        CycleOutcome::Posted { folder, record } => println!(
            "Posted {} ({})",
            folder.name,
            record.platform_post_id.as_deref().unwrap_or("no post id")
        ),
        CycleOutcome::Failed { folder, record } => println!(
            "Failed {}: {}: {}",
            folder.name,
            record.error_class.map(|c| c.as_str()).unwrap_or("unknown"),
            record.error_message.as_deref().unwrap_or("")
        ),
        CycleOutcome::Idle => println!("Nothing pending"),
    })?;

    match outcome {
        CycleOutcome::Failed { folder, .. } => Err(anyhow!("posting {} failed", folder.name)),
        _ => Ok(()),
    }
}

fn print_schedule(format: Format, state: &SchedulerState, tz: Tz) -> anyhow::Result<()> {
    output(format, state, || {
        let slots: Vec<String> = state.slots.iter().map(|s| s.to_string()).collect();
        println!(
            "{} | {} | next: {}",
            if state.enabled { "enabled" } else { "disabled" },
            slots.join(", "),
            format_time(to_datetime(state.next_run), tz)
        );
    })
}

fn print_folders(folders: &[ContentFolder], tz: Tz) {
    for folder in folders {
        println!(
            "{} | {} | discovered {}",
            folder.id,
            folder.name,
            format_time(to_datetime(Some(folder.discovered_at)), tz)
        );
    }
}

fn print_history(history: &[HistoryEntry], tz: Tz) {
    for entry in history {
        let record = &entry.record;
        let detail = if record.is_success() {
            record.platform_post_id.clone().unwrap_or_default()
        } else {
            format!(
                "{}: {}",
                record.error_class.map(|c| c.as_str()).unwrap_or("unknown"),
                record.error_message.as_deref().unwrap_or("")
            )
        };
        println!(
            "{} | {} | {} #{} | {}",
            format_time(to_datetime(Some(record.recorded_at)), tz),
            entry.folder_name,
            record.outcome.as_str(),
            record.attempt,
            detail
        );
    }
}

fn to_datetime(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

fn format_time(time: Option<DateTime<Utc>>, tz: Tz) -> String {
    time.map(|t| t.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z").to_string())
        .unwrap_or_else(|| "-".to_string())
}
