//! `evsink` command surface over [`SqliteEventStore`].
//!
//! Every command opens the store, applies migrations, runs, and then flushes
//! both buffers so nothing accepted by the process is left in memory.
//! Results are printed as pretty JSON on stdout; logs go to stderr.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use eventsink_core::{
    now_utc, parse_rfc3339_utc, EventQueryCriteria, FrameworkEvent,
    FrameworkEventQueryCriteria, JobId, JobStateTable, RunId, TestEvent, TestEventData,
    TestEventHeader, TestEventQueryCriteria,
};
use eventsink_store_sqlite::{
    FlushTelemetrySnapshot, PendingEvents, SqliteEventStore, StoreConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_LEVEL: &str = "warn";

#[derive(Debug, Parser)]
#[command(name = "evsink")]
#[command(about = "Buffered test and framework event store")]
pub struct Cli {
    #[arg(long, default_value = "./eventsink.sqlite3")]
    db: PathBuf,

    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    test_flush_size: Option<usize>,

    #[arg(long)]
    framework_flush_size: Option<usize>,

    /// Log filter directive, overridden by `RUST_LOG`.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply the events schema.
    Migrate,
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },
    TestEvent {
        #[command(subcommand)]
        command: TestEventCommand,
    },
    FrameworkEvent {
        #[command(subcommand)]
        command: FrameworkEventCommand,
    },
    /// Stream category-tagged JSON lines through the buffers.
    Ingest(IngestArgs),
}

#[derive(Debug, Subcommand)]
pub enum JobCommand {
    Register {
        #[arg(long)]
        job_id: u64,
        #[arg(long, default_value = "")]
        name: String,
    },
    State {
        #[arg(long)]
        job_id: u64,
    },
}

#[derive(Debug, Subcommand)]
pub enum TestEventCommand {
    Store(TestEventStoreArgs),
    Query(TestEventQueryArgs),
}

#[derive(Debug, Subcommand)]
pub enum FrameworkEventCommand {
    Store(FrameworkEventStoreArgs),
    Query(EventQueryArgs),
}

#[derive(Debug, Args)]
pub struct TestEventStoreArgs {
    #[arg(long)]
    job_id: u64,
    #[arg(long)]
    run_id: u64,
    #[arg(long)]
    test_name: String,
    #[arg(long, default_value_t = 0)]
    test_attempt: u32,
    #[arg(long, default_value = "")]
    test_step_label: String,
    #[arg(long)]
    event_name: String,
    #[arg(long)]
    target_id: Option<String>,
    #[arg(long)]
    payload_json: Option<String>,
    /// RFC3339 UTC timestamp, defaults to now.
    #[arg(long)]
    emitted_at: Option<String>,
}

#[derive(Debug, Args)]
pub struct FrameworkEventStoreArgs {
    #[arg(long)]
    job_id: u64,
    #[arg(long)]
    event_name: String,
    #[arg(long)]
    payload_json: Option<String>,
    #[arg(long)]
    emitted_at: Option<String>,
}

#[derive(Debug, Args)]
pub struct EventQueryArgs {
    #[arg(long)]
    job_id: Option<u64>,
    /// Repeat to match any of several names.
    #[arg(long = "event-name")]
    event_names: Vec<String>,
    #[arg(long)]
    emitted_after: Option<String>,
    #[arg(long)]
    emitted_before: Option<String>,
}

#[derive(Debug, Args)]
pub struct TestEventQueryArgs {
    #[command(flatten)]
    event: EventQueryArgs,
    #[arg(long)]
    run_id: Option<u64>,
    #[arg(long)]
    test_name: Option<String>,
    #[arg(long)]
    test_step_label: Option<String>,
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[arg(long)]
    file: PathBuf,
}

/// Contents of the `--config` file. Command-line flags win over it.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    pub store: StoreConfig,
    /// Replaces the lifecycle vocabulary when present.
    pub job_states: Option<JobStateTable>,
    pub log_level: Option<String>,
}

/// One line of an ingest file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum IngestRecord {
    Test(TestEvent),
    Framework(FrameworkEvent),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IngestReport {
    pub file: String,
    pub lines_read: usize,
    pub test_events: usize,
    pub framework_events: usize,
    pub pending_before_flush: PendingEvents,
    pub telemetry: FlushTelemetrySnapshot,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration, store setup, the command itself, or
/// the final flush fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    init_logging(cli.log_level.as_deref().or(config.log_level.as_deref()))?;

    let store_config = StoreConfig {
        test_events_flush_size: cli
            .test_flush_size
            .unwrap_or(config.store.test_events_flush_size),
        framework_events_flush_size: cli
            .framework_flush_size
            .unwrap_or(config.store.framework_events_flush_size),
        ..config.store
    };
    let job_states = config.job_states.unwrap_or_else(JobStateTable::lifecycle);

    let store = SqliteEventStore::open(&cli.db, store_config, job_states)
        .with_context(|| format!("failed to open events database {}", cli.db.display()))?;
    store.migrate()?;

    let outcome = run_command(cli.command, &store);
    let flushed = store
        .flush_all()
        .context("failed to flush buffered events on exit");
    outcome?;
    flushed
}

/// Executes one command against an open, migrated store.
///
/// # Errors
/// Returns an error when argument parsing, validation, or the store operation
/// fails.
pub fn run_command(command: Command, store: &SqliteEventStore) -> Result<()> {
    match command {
        Command::Migrate => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "migrated": true }))?
            );
            Ok(())
        }
        Command::Job { command } => run_job(command, store),
        Command::TestEvent { command } => run_test_event(command, store),
        Command::FrameworkEvent { command } => run_framework_event(command, store),
        Command::Ingest(args) => {
            let report = ingest_file(&args.file, store)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn run_job(command: JobCommand, store: &SqliteEventStore) -> Result<()> {
    match command {
        JobCommand::Register { job_id, name } => {
            let inserted = store.register_job(JobId(job_id), &name)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "job_id": job_id,
                    "name": name,
                    "inserted": inserted,
                }))?
            );
            Ok(())
        }
        JobCommand::State { job_id } => {
            let state = store.job_state(JobId(job_id))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "job_id": job_id, "state": state }))?
            );
            Ok(())
        }
    }
}

fn run_test_event(command: TestEventCommand, store: &SqliteEventStore) -> Result<()> {
    match command {
        TestEventCommand::Store(args) => {
            let event = TestEvent::new(
                TestEventHeader {
                    job_id: JobId(args.job_id),
                    run_id: RunId(args.run_id),
                    test_name: args.test_name,
                    test_attempt: args.test_attempt,
                    test_step_label: args.test_step_label,
                },
                TestEventData {
                    event_name: args.event_name,
                    target_id: args.target_id,
                    payload: parse_optional_payload(args.payload_json.as_deref())?,
                },
                parse_optional_utc(args.emitted_at.as_deref())?,
            );
            event.validate()?;
            store.store_test_event(event.clone())?;
            println!("{}", serde_json::to_string_pretty(&event)?);
            Ok(())
        }
        TestEventCommand::Query(args) => {
            let criteria = TestEventQueryCriteria {
                event: event_criteria(&args.event)?,
                run_id: args.run_id.map(RunId),
                test_name: args.test_name,
                test_step_label: args.test_step_label,
            };
            let events = store.get_test_events(&criteria)?;
            println!("{}", serde_json::to_string_pretty(&events)?);
            Ok(())
        }
    }
}

fn run_framework_event(command: FrameworkEventCommand, store: &SqliteEventStore) -> Result<()> {
    match command {
        FrameworkEventCommand::Store(args) => {
            let mut event = FrameworkEvent::new(
                JobId(args.job_id),
                args.event_name,
                parse_optional_utc(args.emitted_at.as_deref())?,
            );
            event.payload = parse_optional_payload(args.payload_json.as_deref())?;
            event.validate()?;
            store.store_framework_event(event.clone())?;
            println!("{}", serde_json::to_string_pretty(&event)?);
            Ok(())
        }
        FrameworkEventCommand::Query(args) => {
            let criteria = FrameworkEventQueryCriteria::from(event_criteria(&args)?);
            let events = store.get_framework_events(&criteria)?;
            println!("{}", serde_json::to_string_pretty(&events)?);
            Ok(())
        }
    }
}

/// Streams an ingest file through the store and flushes both buffers.
///
/// Blank lines are skipped. The first malformed or invalid line stops the
/// ingest; events accepted before it stay accepted.
///
/// # Errors
/// Returns an error naming the offending line, or the store failure.
pub fn ingest_file(path: &Path, store: &SqliteEventStore) -> Result<IngestReport> {
    let file = File::open(path)
        .with_context(|| format!("failed to open ingest file {}", path.display()))?;

    let mut report = IngestReport {
        file: path.display().to_string(),
        lines_read: 0,
        test_events: 0,
        framework_events: 0,
        pending_before_flush: PendingEvents::default(),
        telemetry: FlushTelemetrySnapshot::default(),
    };

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line_number = index + 1;
        let line = line.with_context(|| format!("failed to read line {line_number}"))?;
        report.lines_read += 1;
        if line.trim().is_empty() {
            continue;
        }

        let record: IngestRecord = serde_json::from_str(&line)
            .with_context(|| format!("invalid ingest record on line {line_number}"))?;
        match record {
            IngestRecord::Test(event) => {
                event
                    .validate()
                    .with_context(|| format!("invalid test event on line {line_number}"))?;
                store.store_test_event(event)?;
                report.test_events += 1;
            }
            IngestRecord::Framework(event) => {
                event
                    .validate()
                    .with_context(|| format!("invalid framework event on line {line_number}"))?;
                store.store_framework_event(event)?;
                report.framework_events += 1;
            }
        }
        debug!(line = line_number, "ingested record");
    }

    report.pending_before_flush = store.pending()?;
    store.flush_all()?;
    report.telemetry = store.telemetry();
    info!(
        test_events = report.test_events,
        framework_events = report.framework_events,
        "ingest complete"
    );
    Ok(report)
}

/// Reads the optional JSON configuration file.
///
/// # Errors
/// Returns an error when the file cannot be read or does not match
/// [`CliConfig`].
pub fn load_config(path: Option<&Path>) -> Result<CliConfig> {
    let Some(path) = path else {
        return Ok(CliConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid config file {}", path.display()))
}

/// Installs the stderr subscriber. `RUST_LOG` takes precedence over `level`.
///
/// # Errors
/// Returns an error when the chosen filter directive does not parse.
pub fn init_logging(level: Option<&str>) -> Result<()> {
    let filter = if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        EnvFilter::try_from_default_env().context("invalid RUST_LOG filter")?
    } else {
        let level = level.unwrap_or(DEFAULT_LOG_LEVEL);
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?
    };

    if let Err(err) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        debug!(error = %err, "tracing subscriber already installed");
    }
    Ok(())
}

fn event_criteria(args: &EventQueryArgs) -> Result<EventQueryCriteria> {
    Ok(EventQueryCriteria {
        job_id: args.job_id.map(JobId),
        event_names: args.event_names.clone(),
        emitted_start_time: parse_utc(args.emitted_after.as_deref())?,
        emitted_end_time: parse_utc(args.emitted_before.as_deref())?,
    })
}

fn parse_optional_payload(raw: Option<&str>) -> Result<Option<serde_json::Value>> {
    raw.map(|value| {
        serde_json::from_str(value)
            .with_context(|| format!("payload_json must be valid JSON: {value}"))
    })
    .transpose()
}

fn parse_utc(raw: Option<&str>) -> Result<Option<time::OffsetDateTime>> {
    raw.map(|value| parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")))
        .transpose()
}

fn parse_optional_utc(raw: Option<&str>) -> Result<time::OffsetDateTime> {
    Ok(parse_utc(raw)?.unwrap_or_else(now_utc))
}
