use anyhow::{Context, Result};
use bksave::config::{AppConfig, LogFormat};
use bksave::context::AppContext;
use bksave::core::{
    BackupJob, BackupMode, BackupStatus, BatchSummary, Orchestrator, RunOutcome, read_snapshot,
};
use bksave::logging::{self, LogConfig};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "bksave")]
#[command(about = "Personal file backup runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML config file (default: ./bksave.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage backup jobs
    #[command(subcommand)]
    Jobs(JobsCommand),
    /// Run the jobs picked by a selection such as `1;3-5`
    Run { selection: String },
    /// Print the latest progress snapshot
    Status {
        /// Keep polling until every job has finished
        #[arg(long)]
        watch: bool,
    },
}

#[derive(Subcommand)]
enum JobsCommand {
    List,
    Add {
        name: String,
        source: PathBuf,
        target: PathBuf,
        #[arg(long)]
        differential: bool,
    },
    Remove {
        name: String,
    },
}

#[derive(Args, Serialize)]
struct ConfigArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    business_software: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, global = true)]
    verbose: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, global = true)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.config.as_deref(), Some(&cli.overrides))
        .context("Failed to load configuration")?;

    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    let ctx = AppContext::new(config);

    match cli.command {
        Commands::Jobs(cmd) => run_jobs_command(&ctx, cmd)
            .await
            .context("Job command failed")
            .map(|_| ExitCode::SUCCESS),
        Commands::Run { selection } => run_backup(ctx, &selection)
            .await
            .context("Backup run failed"),
        Commands::Status { watch } => {
            show_status(&ctx.config.state_path(), watch, WATCH_IDLE_LIMIT)
                .await
                .context("Failed to read progress")
                .map(|_| ExitCode::SUCCESS)
        }
    }
}

async fn run_jobs_command(ctx: &AppContext, cmd: JobsCommand) -> Result<()> {
    match cmd {
        JobsCommand::List => {
            let jobs = ctx.jobs.list().await?;
            if jobs.is_empty() {
                println!("No jobs defined.");
            }
            for (i, job) in jobs.iter().enumerate() {
                println!(
                    "{:>2}. {:<20} {:<12} {} -> {}",
                    i + 1,
                    job.name,
                    format!("{:?}", job.mode),
                    job.source.display(),
                    job.target.display()
                );
            }
        }
        JobsCommand::Add {
            name,
            source,
            target,
            differential,
        } => {
            let mode = if differential {
                BackupMode::Differential
            } else {
                BackupMode::Full
            };
            ctx.jobs
                .add(BackupJob::new(name.clone(), source, target, mode))
                .await?;
            println!("Added job `{}`.", name);
        }
        JobsCommand::Remove { name } => {
            ctx.jobs.remove(&name).await?;
            println!("Removed job `{}`.", name);
        }
    }
    Ok(())
}

async fn run_backup(ctx: AppContext, selection: &str) -> Result<ExitCode> {
    let orchestrator = Arc::new(Orchestrator::new(ctx));
    let handles = orchestrator.start(selection).await?;

    let names: Vec<&str> = handles.iter().map(|h| h.name()).collect();
    println!("Started {} job(s): {}", names.len(), names.join(", "));
    println!("Commands: pause [job] | resume [job] | stop [job]");

    spawn_control_reader(orchestrator.clone());

    tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping jobs at the next file");
                orchestrator.stop_all();
            }
        }
    });

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        outcomes.push(handle.wait().await);
    }

    for outcome in &outcomes {
        print_outcome(outcome);
    }

    let summary = BatchSummary::from_outcomes(&outcomes);
    println!(
        "{} completed, {} with errors, {} cancelled",
        summary.completed, summary.errored, summary.cancelled
    );

    Ok(if summary.errored == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_outcome(outcome: &RunOutcome) {
    let state = outcome.state();
    match outcome {
        RunOutcome::Cancelled(_) => println!(
            "  {}: cancelled with {} file(s) left",
            state.name(),
            state.files_remaining
        ),
        RunOutcome::Failed { error, .. } => println!("  {}: failed: {}", state.name(), error),
        RunOutcome::Finished(_) if state.status == BackupStatus::Completed => {
            println!("  {}: completed ({} files)", state.name(), state.total_files)
        }
        RunOutcome::Finished(_) => println!(
            "  {}: finished with errors, last: {} ({})",
            state.name(),
            state.error_message.as_deref().unwrap_or("unknown error"),
            state
                .current_source
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        ),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ControlCommand {
    Pause(Option<String>),
    Resume(Option<String>),
    Stop(Option<String>),
}

impl ControlCommand {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let target = Some(rest.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        match verb.to_ascii_lowercase().as_str() {
            "pause" | "p" => Some(Self::Pause(target)),
            "resume" | "r" => Some(Self::Resume(target)),
            "stop" | "s" => Some(Self::Stop(target)),
            _ => None,
        }
    }
}

/// Read pause/resume/stop commands from stdin while jobs run.
fn spawn_control_reader(orchestrator: Arc<Orchestrator>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }

            let found = match ControlCommand::parse(&line) {
                Some(ControlCommand::Pause(Some(name))) => orchestrator.pause(&name),
                Some(ControlCommand::Resume(Some(name))) => orchestrator.resume(&name),
                Some(ControlCommand::Stop(Some(name))) => orchestrator.stop(&name),
                Some(ControlCommand::Pause(None)) => orchestrator.pause_all() > 0,
                Some(ControlCommand::Resume(None)) => orchestrator.resume_all() > 0,
                Some(ControlCommand::Stop(None)) => orchestrator.stop_all() > 0,
                None => {
                    println!("Use: pause [job] | resume [job] | stop [job]");
                    continue;
                }
            };

            if found {
                info!(command = %line.trim(), "Control command applied");
            } else {
                println!("No matching running job.");
            }
        }
    });
}

/// `status --watch` gives up once the snapshot has not changed for this long,
/// which covers runs that died without writing a final state.
const WATCH_IDLE_LIMIT: Duration = Duration::from_secs(60);

async fn show_status(path: &Path, watch: bool, idle_limit: Duration) -> Result<()> {
    let mut last_update = None;
    let mut idle_since = Instant::now();

    loop {
        let snapshot = read_snapshot(path).await?;

        if snapshot.is_empty() {
            println!("No backup has run yet.");
        }

        for (name, state) in &snapshot {
            let detail = match (&state.error_message, &state.current_source) {
                (Some(error), _) => format!("error: {}", error),
                (None, Some(current)) if !state.is_terminal() => current.display().to_string(),
                _ => String::new(),
            };
            let status = if state.cancelled {
                "Stopped".to_string()
            } else {
                format!("{:?}", state.status)
            };
            println!(
                "{:<20} {:<10} {:>6.1}%  {}/{} files  {}",
                name,
                status,
                state.progress() * 100.0,
                state.total_files - state.files_remaining,
                state.total_files,
                detail
            );
        }

        if !watch || snapshot.values().all(|s| s.is_terminal()) {
            return Ok(());
        }

        let latest = snapshot.values().map(|s| s.updated_at).max();
        if latest != last_update {
            last_update = latest;
            idle_since = Instant::now();
        } else if idle_since.elapsed() >= idle_limit {
            println!("No progress for {}s, stopped watching.", idle_limit.as_secs());
            return Ok(());
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        println!();
    }
}
