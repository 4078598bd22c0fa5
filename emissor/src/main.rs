//! emissor - replicate posts to remote receiver sites
//!
//! This tool provides commands for:
//! - Running the queue processor on its fixed cadence, or a single cycle
//! - Queueing post events for replication
//! - Managing receiver sites and checking their tokens
//! - Inspecting the queue, delivery reports and the activity log
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/emissor/data.db (~/.local/share/emissor/data.db)
//! - Config: $XDG_CONFIG_HOME/emissor/config.toml (~/.config/emissor/config.toml)
//! - Logs: $XDG_STATE_HOME/emissor/ (~/.local/state/emissor/)

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use emissor_core::activity::DEFAULT_LIST_LIMIT;
use emissor_core::reports::DEFAULT_RECENT_LIMIT;
use emissor_core::{
    ActionKind, Config, DeleteRequest, DeliveryResult, Emissor, JobAction, JobStatus, LogLevel,
    PostPayload, ReceiverInput, ReceiverStatus, Report, StatusUpdate,
};
use std::future::Future;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "emissor")]
#[command(about = "Replicate posts to remote receiver sites")]
#[command(version)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/emissor/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output (writes diagnostic logs to the state directory)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process the queue on a fixed interval until interrupted
    Run,

    /// Run a single processing cycle
    Process,

    /// Queue a post event for replication
    Enqueue {
        /// JSON file holding the post (or at least `ID` and `status`)
        #[arg(long)]
        post: PathBuf,

        /// Receiver indices, as shown by `receivers list`
        #[arg(long, value_delimiter = ',', required = true)]
        receivers: Vec<usize>,

        /// Operation to replicate
        #[arg(long, default_value = "send")]
        action: ActionKind,

        /// User id recorded in the activity log
        #[arg(long)]
        actor: Option<i64>,
    },

    /// Manage receiver sites
    Receivers {
        #[command(subcommand)]
        command: ReceiversCommand,
    },

    /// Inspect and maintain the job queue
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },

    /// Show delivery reports
    Report {
        #[command(subcommand)]
        command: ReportCommand,
    },

    /// Show or prune the activity log
    Logs {
        #[command(subcommand)]
        command: LogsCommand,
    },
}

#[derive(Subcommand)]
enum ReceiversCommand {
    /// List receivers with their selection index
    List,

    /// Register a receiver site
    Add {
        #[arg(long)]
        url: String,
        /// Display name (default: the URL host)
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long)]
        token: Option<String>,
        #[arg(long, default_value = "active")]
        status: ReceiverStatus,
    },

    /// Change a receiver; omitted fields keep their value
    Edit {
        id: i64,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        status: Option<ReceiverStatus>,
    },

    /// Delete a receiver
    Remove { id: i64 },

    /// Check that a receiver is reachable and accepts its token
    Test { id: i64 },
}

#[derive(Subcommand)]
enum QueueCommand {
    /// Job counts per status
    Stats,

    /// Most recent jobs
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Cancel a pending job
    Cancel { id: i64 },

    /// Delete completed jobs older than the retention window
    Cleanup {
        /// Retention in days (default: from config)
        #[arg(long)]
        days: Option<u32>,
    },
}

#[derive(Subcommand)]
enum ReportCommand {
    /// Latest report for a post
    Latest { post_id: i64 },

    /// Most recent reports
    Recent {
        #[arg(short, long, default_value_t = DEFAULT_RECENT_LIMIT)]
        limit: usize,
    },

    /// Totals across all reports
    Stats,

    /// Read (and consume) the pending notification for a post
    Notification { post_id: i64 },
}

#[derive(Subcommand)]
enum LogsCommand {
    /// Most recent entries
    List {
        #[arg(long)]
        level: Option<LogLevel>,
        #[arg(short, long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
    },

    /// Delete entries older than the retention window
    Cleanup {
        /// Retention in days (default: from config)
        #[arg(long)]
        days: Option<u32>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };

    // The processor always logs; other commands only when asked.
    let _log_guard = if args.verbose || matches!(args.command, Command::Run) {
        Some(emissor_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    let app = Emissor::open(config).context("failed to open emissor")?;

    match args.command {
        Command::Run => cmd_run(&app),
        Command::Process => cmd_process(&app),
        Command::Enqueue {
            post,
            receivers,
            action,
            actor,
        } => cmd_enqueue(&app, &post, &receivers, action, actor),
        Command::Receivers { command } => cmd_receivers(&app, command),
        Command::Queue { command } => cmd_queue(&app, command),
        Command::Report { command } => cmd_report(&app, command),
        Command::Logs { command } => cmd_logs(&app, command),
    }
}

/// Drive an async operation to completion on a fresh runtime.
fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    Ok(runtime.block_on(future))
}

fn cmd_run(app: &Emissor) -> Result<()> {
    let processor = app.processor();
    println!(
        "Processing queue every {}s (Ctrl-C to stop)",
        app.config().queue.interval_secs
    );

    block_on(processor.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
    }))?;

    println!("Stopped.");
    Ok(())
}

fn cmd_process(app: &Emissor) -> Result<()> {
    let outcome = block_on(app.processor().process_cycle())?.context("processing cycle failed")?;

    println!(
        "Claimed {} job(s): {} completed, {} skipped",
        outcome.claimed, outcome.completed, outcome.skipped
    );
    if outcome.abandoned > 0 {
        println!(
            "{} job(s) abandoned: claimed by another cycle",
            outcome.abandoned
        );
    }
    for report in &outcome.reports {
        println!();
        print_report(report);
    }
    Ok(())
}

fn cmd_enqueue(
    app: &Emissor,
    path: &Path,
    receivers: &[usize],
    action: ActionKind,
    actor: Option<i64>,
) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("{} is not JSON", path.display()))?;

    let job = match action {
        ActionKind::Send => {
            let post: PostPayload =
                serde_json::from_value(value).context("post file is missing required fields")?;
            JobAction::Send(post)
        }
        ActionKind::UpdateStatus => JobAction::UpdateStatus(StatusUpdate {
            post_id: post_id_of(&value)?,
            status: value
                .get("status")
                .and_then(|s| s.as_str())
                .context("post file has no `status`")?
                .to_string(),
        }),
        ActionKind::Delete => JobAction::Delete(DeleteRequest::new(post_id_of(&value)?)),
    };

    let post_id = job.post_id();
    match app
        .trigger(actor)
        .submit(job, receivers)
        .context("failed to queue job")?
    {
        Some(id) => println!("Queued job {} ({}) for post {}", id, action.as_str(), post_id),
        None => println!("No active receivers matched {:?}; nothing queued", receivers),
    }
    Ok(())
}

fn post_id_of(value: &serde_json::Value) -> Result<i64> {
    value
        .get("ID")
        .and_then(|id| id.as_i64())
        .context("post file has no numeric `ID`")
}

fn cmd_receivers(app: &Emissor, command: ReceiversCommand) -> Result<()> {
    let registry = app.registry();

    match command {
        ReceiversCommand::List => {
            let receivers = registry.get_all().context("failed to list receivers")?;
            if receivers.is_empty() {
                println!("No receivers registered.");
                return Ok(());
            }
            println!(
                "{:<6} {:<5} {:<9} {:<6} {:<20} URL",
                "INDEX", "ID", "STATUS", "TOKEN", "NAME"
            );
            for (index, receiver) in receivers.iter().enumerate() {
                println!(
                    "{:<6} {:<5} {:<9} {:<6} {:<20} {}",
                    index,
                    receiver.id,
                    receiver.status.as_str(),
                    if receiver.auth_token.is_some() { "set" } else { "-" },
                    truncate(&receiver.name, 20),
                    receiver.url
                );
            }
        }
        ReceiversCommand::Add {
            url,
            name,
            token,
            status,
        } => {
            let receiver = registry
                .add(ReceiverInput {
                    name,
                    url,
                    auth_token: token,
                    status,
                })
                .context("failed to add receiver")?;
            println!("Added receiver {} ({})", receiver.id, receiver.url);
        }
        ReceiversCommand::Edit {
            id,
            url,
            name,
            token,
            status,
        } => {
            let Some(current) = registry.get_by_id(id)? else {
                bail!("receiver {} not found", id);
            };
            let receiver = registry
                .update(
                    id,
                    ReceiverInput {
                        name: name.unwrap_or(current.name),
                        url: url.unwrap_or(current.url),
                        auth_token: token,
                        status: status.unwrap_or(current.status),
                    },
                )
                .context("failed to update receiver")?;
            println!("Updated receiver {} ({})", receiver.id, receiver.url);
        }
        ReceiversCommand::Remove { id } => {
            if registry.remove(id)? {
                println!("Removed receiver {}", id);
            } else {
                bail!("receiver {} not found", id);
            }
        }
        ReceiversCommand::Test { id } => {
            let Some(receiver) = registry.get_by_id(id)? else {
                bail!("receiver {} not found", id);
            };
            let result = block_on(app.delivery().test_connection(&receiver))?;
            print_result(&result);
            if !result.is_ok() {
                bail!("connection test failed");
            }
        }
    }
    Ok(())
}

fn cmd_queue(app: &Emissor, command: QueueCommand) -> Result<()> {
    let queue = app.queue();

    match command {
        QueueCommand::Stats => {
            let stats = queue.stats().context("failed to read queue")?;
            println!("Queue");
            println!("=====");
            println!("Pending:     {}", stats.pending);
            println!("Processing:  {}", stats.processing);
            println!("Completed:   {}", stats.completed);
            println!("Cancelled:   {}", stats.cancelled);
            println!("Failed:      {}", stats.failed);
            println!("Total:       {}", stats.total);
        }
        QueueCommand::List { status, limit } => {
            let entries = queue.list(status, limit).context("failed to list jobs")?;
            if entries.is_empty() {
                println!("No jobs.");
                return Ok(());
            }
            println!(
                "{:<6} {:<8} {:<14} {:<11} {:<10} CREATED",
                "ID", "POST", "ACTION", "STATUS", "RECEIVERS"
            );
            for entry in entries {
                println!(
                    "{:<6} {:<8} {:<14} {:<11} {:<10} {}",
                    entry.id,
                    entry.post_id,
                    entry.action,
                    entry.status,
                    entry
                        .receiver_count
                        .map_or_else(|| "?".to_string(), |n| n.to_string()),
                    entry.created_at.format("%Y-%m-%d %H:%M:%S")
                );
                if let Some(error) = entry.error {
                    println!("       error: {}", error);
                }
            }
        }
        QueueCommand::Cancel { id } => {
            if queue.cancel(id)? {
                println!("Cancelled job {}", id);
            } else {
                bail!("job {} is not pending", id);
            }
        }
        QueueCommand::Cleanup { days } => {
            let days = days.unwrap_or(app.config().queue.retention_days);
            let removed = queue.cleanup(days).context("failed to clean up queue")?;
            println!("Removed {} completed job(s) older than {} day(s)", removed, days);
        }
    }
    Ok(())
}

fn cmd_report(app: &Emissor, command: ReportCommand) -> Result<()> {
    let reports = app.reports();

    match command {
        ReportCommand::Latest { post_id } => match reports.get_latest(post_id)? {
            Some(report) => print_report(&report),
            None => println!("No report for post {}", post_id),
        },
        ReportCommand::Recent { limit } => {
            let recent = reports.get_recent(limit)?;
            if recent.is_empty() {
                println!("No reports.");
            }
            for report in recent {
                println!(
                    "{}  post {:<8} {}/{} ok ({:.2}%)",
                    report.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    report.post_id,
                    report.summary.success,
                    report.summary.total,
                    report.summary.success_rate
                );
            }
        }
        ReportCommand::Stats => {
            let stats = reports.general_stats()?;
            println!("Reports:       {}", stats.total_reports);
            println!("Deliveries OK: {}", stats.success_count);
            println!("Failures:      {}", stats.error_count);
            println!("Success rate:  {:.2}%", stats.success_rate);
        }
        ReportCommand::Notification { post_id } => match reports.take_notification(post_id)? {
            Some(report) => print_report(&report),
            None => println!("No pending notification for post {}", post_id),
        },
    }
    Ok(())
}

fn cmd_logs(app: &Emissor, command: LogsCommand) -> Result<()> {
    let activity = app.activity();

    match command {
        LogsCommand::List { level, limit } => {
            let entries = activity.entries(level, limit)?;
            if entries.is_empty() {
                println!("No log entries.");
            }
            for entry in entries {
                let context = if entry.context.as_object().is_some_and(|o| o.is_empty()) {
                    String::new()
                } else {
                    format!(" {}", entry.context)
                };
                println!(
                    "{} {:<7} {}{}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.level.as_str(),
                    entry.message,
                    context
                );
            }
        }
        LogsCommand::Cleanup { days } => {
            let days = days.unwrap_or(app.config().logging.retention_days);
            let removed = activity.cleanup(days)?;
            println!("Removed {} log entries older than {} day(s)", removed, days);
        }
    }
    Ok(())
}

fn print_report(report: &Report) {
    println!(
        "Post {} at {}",
        report.post_id,
        report.timestamp.format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "  {} total, {} ok, {} failed ({:.2}%)",
        report.summary.total,
        report.summary.success,
        report.summary.errors,
        report.summary.success_rate
    );
    for result in &report.results {
        print!("  ");
        print_result(result);
    }
}

fn print_result(result: &DeliveryResult) {
    println!(
        "{:<4} {}  {} (attempts: {})",
        result.status.as_str(),
        result.receiver_url,
        result.message,
        result.attempts
    );
}

/// Truncate a string to max chars, adding "..." if truncated
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}
