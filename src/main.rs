//! harvest - persistent command scheduler.
//!
//! Usage:
//!   harvest start [--foreground] [--workers N] [--api]   Run the scheduler
//!   harvest stop                                         Stop the running scheduler
//!   harvest add <name> --command CMD --daily --time 02:00
//!   harvest run-once --job-type transcripts --wait
//!   harvest logs [--job NAME] [--level error] [--tail N | --all]
//!   harvest list | history | status | export | show-config | init

use clap::{ArgGroup, Args, Parser, Subcommand};
use harvest::api;
use colored::Colorize;
use harvest::config::{Config, ScheduleEntry, ScheduleSpec, YamlLoader, parse_datetime};
use harvest::logging::{LogFiles, LogQuery, line_level, read_logs};
use harvest::scheduler::lock;
use harvest::{
    Event, EventBus, EventHandler, FileStorage, InMemoryStorage, JobCommand, JobManager, JobName,
    RunOnceOptions, RunStatus, Scheduler, SchedulerError, Storage,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// How long `stop` waits for the scheduler to exit before killing it.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// harvest - persistent command scheduler
#[derive(Parser)]
#[command(name = "harvest")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler in this process until stopped
    Start {
        /// Echo command output to stdout
        #[arg(short, long)]
        foreground: bool,

        /// Worker pool size (overrides the config)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Serve the control API
        #[arg(long)]
        api: bool,
    },

    /// Stop the running scheduler
    Stop,

    /// Show whether a scheduler is running and what is due next
    Status,

    /// List all jobs
    List,

    /// Add a recurring job
    Add {
        /// Unique job name
        #[arg(value_name = "NAME")]
        name: String,

        #[command(flatten)]
        target: CommandArgs,

        #[command(flatten)]
        schedule: ScheduleArgs,

        /// Per-execution timeout in seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Retries after a failed attempt
        #[arg(long)]
        max_retries: Option<u32>,

        /// Base delay between retries in seconds
        #[arg(long, value_name = "SECS")]
        retry_delay: Option<u64>,

        #[arg(long)]
        description: Option<String>,

        /// Store the job disabled
        #[arg(long)]
        disabled: bool,
    },

    /// Remove a job
    Remove {
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Enable a job
    Enable {
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Disable a job without removing it
    Disable {
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Queue a one-time job
    RunOnce {
        #[command(flatten)]
        target: CommandArgs,

        /// When to run ("YYYY-MM-DD HH:MM" in the configured timezone, or RFC 3339)
        #[arg(long, value_name = "TIME")]
        at: Option<String>,

        /// Per-execution timeout in seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Retries after a failed attempt
        #[arg(long)]
        max_retries: Option<u32>,

        /// Wait until the job reaches a terminal state
        #[arg(long)]
        wait: bool,
    },

    /// Show run history, newest first
    History {
        /// Only runs of this job
        #[arg(long, value_name = "NAME")]
        job: Option<String>,

        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    ShowConfig,

    /// Print all stored jobs as config `schedules` entries
    Export,

    /// Show scheduler log lines, oldest first
    Logs {
        /// Only lines mentioning this job
        #[arg(long, value_name = "NAME")]
        job: Option<String>,

        /// Only lines at this level
        #[arg(long, value_parser = ["error", "warn", "info", "debug", "trace"])]
        level: Option<String>,

        /// Show the last N matching lines
        #[arg(short = 'n', long, default_value = "50")]
        tail: usize,

        /// Show every matching line
        #[arg(short, long)]
        all: bool,

        /// Color lines by level
        #[arg(long)]
        color: bool,
    },
}

/// What a job executes: a shell command or a typed job.
#[derive(Args)]
struct CommandArgs {
    /// Shell command line
    #[arg(long, conflicts_with = "job_type", required_unless_present = "job_type")]
    command: Option<String>,

    /// Configured job type
    #[arg(long)]
    job_type: Option<String>,

    /// Option for a typed job, rendered as `--KEY VALUE`
    #[arg(long = "option", value_name = "KEY=VALUE", requires = "job_type")]
    options: Vec<String>,
}

impl CommandArgs {
    fn options(&self) -> Result<BTreeMap<String, Value>, String> {
        self.options
            .iter()
            .map(|pair| {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("option '{}' is not KEY=VALUE", pair))?;
                let value = serde_json::from_str(value)
                    .unwrap_or_else(|_| Value::String(value.to_string()));
                Ok((key.to_string(), value))
            })
            .collect()
    }

    fn job_command(&self) -> Result<JobCommand, String> {
        match (&self.job_type, &self.command) {
            (Some(kind), None) => Ok(JobCommand::typed(kind.clone(), self.options()?)),
            (None, Some(command)) => Ok(JobCommand::shell(command.clone())),
            _ => Err("set exactly one of --command or --job-type".to_string()),
        }
    }
}

/// When a recurring job fires.
#[derive(Args)]
#[command(group(
    ArgGroup::new("kind")
        .required(true)
        .args(["daily", "weekly", "interval", "cron"])
))]
struct ScheduleArgs {
    /// Every day at --time
    #[arg(long)]
    daily: bool,

    /// Every week on --day at --time
    #[arg(long)]
    weekly: bool,

    /// Every --hours/--minutes/--seconds
    #[arg(long)]
    interval: bool,

    /// Cron expression (seconds field optional)
    #[arg(long, value_name = "EXPR")]
    cron: Option<String>,

    /// Time of day, HH:MM
    #[arg(long)]
    time: Option<String>,

    /// Day of week (e.g. monday)
    #[arg(long)]
    day: Option<String>,

    #[arg(long)]
    hours: Option<u64>,

    #[arg(long)]
    minutes: Option<u64>,

    #[arg(long)]
    seconds: Option<u64>,
}

impl ScheduleArgs {
    fn spec(&self) -> ScheduleSpec {
        let kind = if self.daily {
            "daily"
        } else if self.weekly {
            "weekly"
        } else if self.interval {
            "interval"
        } else {
            "cron"
        };
        ScheduleSpec {
            kind: kind.to_string(),
            time: self.time.clone(),
            day: self.day.clone(),
            hours: self.hours,
            minutes: self.minutes,
            seconds: self.seconds,
            cron: self.cron.clone(),
            at: None,
        }
    }
}

/// Logging event handler that reports job lifecycle events.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::JobDispatched { job, run_id, .. } => {
                info!("Job '{}' dispatched (run: {})", job, run_id);
            }
            Event::AttemptStarted {
                job,
                attempt,
                max_attempts,
                ..
            } if *max_attempts > 1 => {
                info!("  Job '{}' attempt {}/{}", job, attempt, max_attempts);
            }
            Event::AttemptFailed {
                job,
                attempt,
                error,
                stderr,
                ..
            } => {
                warn!("  Job '{}' attempt {} failed: {}", job, attempt, error);
                if let Some(err) = stderr {
                    for line in err.trim().lines() {
                        warn!("    stderr: {}", line);
                    }
                }
            }
            Event::RetryScheduled { job, delay, .. } => {
                info!("  Job '{}' retrying in {:?}", job, delay);
            }
            Event::JobSucceeded {
                job,
                run_id,
                attempts,
                duration,
                ..
            } => {
                info!(
                    "Job '{}' succeeded in {:?} after {} attempt(s) (run: {})",
                    job, duration, attempts, run_id
                );
            }
            Event::JobFailed {
                job,
                run_id,
                attempts,
                error,
                ..
            } => {
                error!(
                    "Job '{}' failed after {} attempt(s): {} (run: {})",
                    job, attempts, error, run_id
                );
            }
            Event::JobAbandoned { job, attempts, .. } => {
                warn!(
                    "Job '{}' abandoned after {} attempt(s): scheduler stopping",
                    job, attempts
                );
            }
            Event::JobRemoved { job, .. } => {
                info!("One-time job '{}' removed", job);
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(harvest::config::default_config_path);

    if let Commands::Init { force } = cli.command {
        YamlLoader::init(&config_path, force)?;
        println!("Wrote default configuration to {}", config_path.display());
        return Ok(());
    }

    let config = YamlLoader::load_or_default(&config_path)?;
    init_logging(&config, cli.verbose)?;

    match cli.command {
        Commands::Stop => stop_scheduler(&config).await,
        Commands::ShowConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Commands::Logs {
            job,
            level,
            tail,
            all,
            color,
        } => {
            let level = level.map(|l| l.parse::<tracing::Level>()).transpose()?;
            let query = LogQuery {
                job,
                level,
                tail: (!all).then_some(tail),
            };
            show_logs(&config, &query, color)
        }
        command => match config.storage.backend {
            harvest::config::StorageBackend::Memory => {
                warn!("Using in-memory storage; jobs are lost when this process exits");
                run_command(command, &config, Arc::new(InMemoryStorage::new())).await
            }
            harvest::config::StorageBackend::Json => {
                let path = storage_path(&config)?;
                let storage = FileStorage::open(&path).await?;
                run_command(command, &config, Arc::new(storage)).await
            }
            #[cfg(feature = "sqlite")]
            harvest::config::StorageBackend::Sqlite => {
                let path = storage_path(&config)?;
                let storage = harvest::SqliteStorage::new(&path).await?;
                run_command(command, &config, Arc::new(storage)).await
            }
            #[cfg(not(feature = "sqlite"))]
            harvest::config::StorageBackend::Sqlite => {
                Err("this build has no SQLite support; use the json or memory backend".into())
            }
        },
    }
}

/// Initialize tracing. `RUST_LOG` wins over `--verbose`, which wins over the
/// configured level.
fn init_logging(config: &Config, verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let default_level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;

    let (writer, ansi) = match LogFiles::from_config(&config.logging) {
        Some(files) => {
            std::fs::create_dir_all(files.dir())?;
            let appender = files.appender(&config.logging)?;
            (BoxMakeWriter::new(appender), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi);
    match config.logging.format {
        harvest::config::LogFormat::Pretty => builder.init(),
        harvest::config::LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

/// Print configured log lines matching `query`.
fn show_logs(
    config: &Config,
    query: &LogQuery,
    color: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(files) = LogFiles::from_config(&config.logging) else {
        return Err("logging.file is not set; the scheduler logs to stderr".into());
    };
    let paths = files.list()?;
    if paths.is_empty() {
        println!("No log files found in {}", files.dir().display());
        println!("Logs are written there once the scheduler runs with logging.file set.");
        return Ok(());
    }

    let lines = read_logs(&paths, query)?;
    if lines.is_empty() {
        println!("No matching log entries found.");
        if let Some(job) = &query.job {
            println!("  Filter: job contains '{}'", job);
        }
        if let Some(level) = query.level {
            println!("  Filter: level = {}", level);
        }
        return Ok(());
    }

    if color {
        colored::control::set_override(true);
    }
    for line in &lines {
        if !color {
            println!("{}", line);
            continue;
        }
        match line_level(line) {
            Some(tracing::Level::ERROR) => println!("{}", line.red()),
            Some(tracing::Level::WARN) => println!("{}", line.yellow()),
            Some(tracing::Level::INFO) => println!("{}", line.green()),
            _ => println!("{}", line),
        }
    }
    println!(
        "\n--- Showing {} log entries from {} ---",
        lines.len(),
        files.dir().display()
    );
    Ok(())
}

fn create_parent(path: &Path) -> std::io::Result<()> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => std::fs::create_dir_all(parent),
        None => Ok(()),
    }
}

fn storage_path(config: &Config) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let path = config
        .storage_path()
        .ok_or("storage backend has no path")?;
    create_parent(&path)?;
    Ok(path)
}

fn job_manager<S: Storage>(
    config: &Config,
    storage: Arc<S>,
) -> Result<JobManager<S>, Box<dyn std::error::Error>> {
    Ok(JobManager::new(storage)
        .with_timezone(config.timezone()?)
        .with_job_types(config.job_types.clone())
        .with_interval_immediate(config.interval_immediate())
        .with_default_timeout(config.default_timeout()))
}

/// Run every command that works on the job table.
async fn run_command<S: Storage + 'static>(
    command: Commands,
    config: &Config,
    storage: Arc<S>,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Start {
            foreground,
            workers,
            api,
        } => start_scheduler(config, storage, foreground, workers, api).await,
        Commands::Status => show_status(config, job_manager(config, storage)?).await,
        Commands::List => list_jobs(job_manager(config, storage)?).await,
        Commands::Add {
            name,
            target,
            schedule,
            timeout,
            max_retries,
            retry_delay,
            description,
            disabled,
        } => {
            let entry = ScheduleEntry {
                name,
                job_type: target.job_type.clone(),
                command: target.command.clone(),
                enabled: !disabled,
                schedule: schedule.spec(),
                options: target.options()?,
                timeout_secs: timeout,
                max_retries,
                retry_delay_secs: retry_delay,
                description,
            };
            let job = entry.to_job(config.default_timeout())?;
            let job = job_manager(config, storage)?.add(job).await?;
            println!("Added job '{}' ({})", job.name, job.schedule);
            if let Some(next) = job.next_run_at {
                println!("Next run: {}", format_time(config, next));
            }
            Ok(())
        }
        Commands::Remove { name } => {
            job_manager(config, storage)?
                .remove(&JobName::new(&name))
                .await?;
            println!("Removed job '{}'", name);
            Ok(())
        }
        Commands::Enable { name } => {
            job_manager(config, storage)?
                .enable(&JobName::new(&name))
                .await?;
            println!("Enabled job '{}'", name);
            Ok(())
        }
        Commands::Disable { name } => {
            job_manager(config, storage)?
                .disable(&JobName::new(&name))
                .await?;
            println!("Disabled job '{}'", name);
            Ok(())
        }
        Commands::RunOnce {
            target,
            at,
            timeout,
            max_retries,
            wait,
        } => {
            let manager = job_manager(config, storage)?;
            let at = match at {
                Some(at) => Some(parse_datetime(&at, config.timezone()?)?),
                None => None,
            };
            let options = RunOnceOptions {
                timeout: timeout.map(Duration::from_secs),
                max_retries,
                description: None,
            };
            let job = manager.run_once(target.job_command()?, at, options).await?;
            println!("Queued one-time job '{}'", job.name);
            if lock::running_pid(config.lock_path())?.is_none() {
                warn!("No scheduler is running; the job runs once one is started");
            }
            if wait {
                wait_for_one_time(&manager, &job.name).await?;
            }
            Ok(())
        }
        Commands::History { job, limit } => {
            let manager = job_manager(config, storage)?;
            let job = job.map(JobName::new);
            show_history(config, &manager, job.as_ref(), limit).await
        }
        Commands::Export => {
            #[derive(Serialize)]
            struct Export {
                schedules: Vec<ScheduleEntry>,
            }
            let jobs = job_manager(config, storage)?.export().await?;
            let export = Export {
                schedules: jobs.iter().map(ScheduleEntry::from_job).collect(),
            };
            print!("{}", serde_yaml::to_string(&export)?);
            Ok(())
        }
        Commands::Init { .. } | Commands::Stop | Commands::ShowConfig | Commands::Logs { .. } => {
            Ok(())
        }
    }
}

/// Run the scheduler until Ctrl+C, SIGTERM or an API shutdown.
async fn start_scheduler<S: Storage + 'static>(
    config: &Config,
    storage: Arc<S>,
    foreground: bool,
    workers: Option<usize>,
    api: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let workers = workers.unwrap_or(config.scheduler.workers);
    if workers == 0 {
        return Err("--workers must be at least 1".into());
    }

    // Create event bus with logging handler
    let event_bus = EventBus::new();
    event_bus.register(Arc::new(LoggingHandler)).await;

    let scheduler = Scheduler::with_storage(storage)
        .with_event_bus(event_bus)
        .with_timezone(config.timezone()?)
        .with_job_types(config.job_types.clone())
        .with_retry_defaults(config.retry.clone())
        .with_tick_interval(Duration::from_secs(config.scheduler.tick_interval_secs))
        .with_workers(workers)
        .with_shutdown_timeout(Duration::from_secs(config.scheduler.shutdown_timeout_secs))
        .with_history_limit(config.scheduler.history_limit)
        .with_interval_immediate(config.interval_immediate())
        .with_echo_output(foreground)
        .with_lock_file(config.lock_path())
        .with_seed_jobs(config.seed_jobs()?);
    let manager = scheduler
        .manager()
        .with_default_timeout(config.default_timeout());

    info!(
        "Starting scheduler (workers: {}, tick interval: {}s, timezone: {})...",
        workers, config.scheduler.tick_interval_secs, config.scheduler.timezone
    );
    let (handle, mut scheduler_task) = scheduler.start().await?;

    let api_server = if api || config.api.enabled {
        let state = api::create_api_state(manager, Some(handle.clone()), config.default_timeout());
        Some(api::start_server(&config.api, state).await?)
    } else {
        None
    };

    info!("Press Ctrl+C to stop");
    tokio::select! {
        result = shutdown_signal() => {
            result?;
            info!("Shutting down...");
            match handle.shutdown().await {
                Ok(()) | Err(SchedulerError::ChannelError(_)) => {}
                Err(e) => return Err(e.into()),
            }
            if let Err(e) = scheduler_task.await {
                error!("Scheduler task failed: {}", e);
            }
        }
        result = &mut scheduler_task => {
            if let Err(e) = result {
                error!("Scheduler task failed: {}", e);
            }
        }
    }

    if let Some(server) = api_server {
        server.abort();
    }
    info!("Scheduler stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Signal the PID in the lock file and wait for it to exit.
async fn stop_scheduler(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let lock_path = config.lock_path();
    let Some(pid) = lock::running_pid(&lock_path)? else {
        return Err("scheduler is not running".into());
    };

    info!("Sending SIGTERM to scheduler (pid {})", pid);
    lock::terminate(pid)?;

    let deadline = tokio::time::Instant::now() + STOP_TIMEOUT;
    while lock::process_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            warn!(
                "Scheduler (pid {}) still running after {:?}, sending SIGKILL",
                pid, STOP_TIMEOUT
            );
            lock::kill(pid)?;
            if let Err(e) = std::fs::remove_file(&lock_path) {
                warn!("Could not remove lock file {}: {}", lock_path.display(), e);
            }
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    println!("Scheduler stopped");
    Ok(())
}

async fn show_status<S: Storage>(
    config: &Config,
    manager: JobManager<S>,
) -> Result<(), Box<dyn std::error::Error>> {
    match lock::running_pid(config.lock_path())? {
        Some(pid) => println!("Scheduler: running (pid {})", pid),
        None => println!("Scheduler: stopped"),
    }

    let jobs = manager.list().await?;
    let enabled = jobs.iter().filter(|j| j.enabled).count();
    println!("Jobs: {} ({} enabled)", jobs.len(), enabled);
    if let Some(next) = jobs
        .iter()
        .filter(|j| j.enabled)
        .filter_map(|j| j.next_run_at.map(|at| (at, &j.name)))
        .min_by_key(|(at, _)| *at)
    {
        println!("Next: '{}' at {}", next.1, format_time(config, next.0));
    }
    Ok(())
}

async fn list_jobs<S: Storage>(manager: JobManager<S>) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = manager.list().await?;
    if jobs.is_empty() {
        println!("No jobs");
        return Ok(());
    }

    println!(
        "{:<30} {:<22} {:<8} {:<20} {:<12}",
        "NAME", "SCHEDULE", "ENABLED", "NEXT RUN", "LAST STATUS"
    );
    for job in &jobs {
        println!(
            "{:<30} {:<22} {:<8} {:<20} {:<12}",
            job.name.as_str(),
            job.schedule,
            if job.enabled { "yes" } else { "no" },
            job.next_run_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            job.last_status.map(|s| s.as_str()).unwrap_or("-"),
        );
    }
    Ok(())
}

async fn show_history<S: Storage>(
    config: &Config,
    manager: &JobManager<S>,
    job: Option<&JobName>,
    limit: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let runs = manager.history(job, limit).await?;
    if runs.is_empty() {
        println!("No runs");
        return Ok(());
    }

    for run in &runs {
        let duration = run
            .duration()
            .map(|d| format!("{:.1}s", d.num_milliseconds() as f64 / 1000.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<30} {:<11} attempts={} exit={} duration={}",
            format_time(config, run.started_at),
            run.job_name.as_str(),
            run.status.as_str(),
            run.attempts,
            run.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            duration,
        );
        if let Some(error) = &run.error {
            println!("    error: {}", error);
        }
    }
    Ok(())
}

/// Poll until a one-time job has been removed (or left interrupted), then
/// report its run.
async fn wait_for_one_time<S: Storage>(
    manager: &JobManager<S>,
    name: &JobName,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Waiting for '{}' to finish...", name);
    loop {
        match manager.get(name).await {
            Err(SchedulerError::JobNotFound(_)) => break,
            Ok(job) if job.last_status == Some(RunStatus::Interrupted) => break,
            Ok(_) => tokio::time::sleep(Duration::from_secs(1)).await,
            Err(e) => return Err(e.into()),
        }
    }

    let run = manager.history(Some(name), 1).await?.into_iter().next();
    match run {
        Some(run) => {
            println!(
                "'{}' {} after {} attempt(s)",
                name, run.status, run.attempts
            );
            if let Some(stdout) = run.stdout.as_deref().filter(|s| !s.trim().is_empty()) {
                println!("{}", stdout.trim_end());
            }
            if run.status != RunStatus::Succeeded {
                return Err(run
                    .error
                    .unwrap_or_else(|| format!("job '{}' {}", name, run.status))
                    .into());
            }
            Ok(())
        }
        None => Err(format!("no run recorded for '{}'", name).into()),
    }
}

fn format_time(config: &Config, at: chrono::DateTime<chrono::Utc>) -> String {
    match config.timezone() {
        Ok(tz) => at.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S %Z").to_string(),
        Err(_) => at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    }
}
