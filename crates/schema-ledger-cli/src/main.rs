use std::fs::File;
use std::io::{self, BufReader, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use schema_ledger_core::{ReconcileError, RunContext, Sequence};
use schema_ledger_store_sqlite::{LogReport, SqliteStore};
use serde_json::{Map, Value};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod config;

use config::LedgerConfig;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const RECONCILE_FAILURE_EXIT: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "ledger")]
#[command(about = "Apply line-oriented schema statements against a tracked migration log")]
struct Cli {
    /// YAML config file; explicit flags take precedence over its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Migration log table name.
    #[arg(long, global = true)]
    table: Option<String>,

    /// Abort the run after this many seconds (0 disables the deadline).
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    /// Log filter directive used when RUST_LOG is unset.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply every statement not yet recorded in the log.
    Apply(ApplyArgs),
    /// Report which statements are recorded and which are pending.
    Status(SourceArgs),
    /// Print the recorded log with its contiguity check and fingerprint.
    Log,
}

#[derive(Debug, Args)]
struct SourceArgs {
    /// Statement file, one statement per line, or `-` for stdin.
    #[arg(long)]
    source: PathBuf,
}

#[derive(Debug, Args)]
struct ApplyArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

impl Cli {
    fn overrides(&self) -> LedgerConfig {
        LedgerConfig {
            db: self.db.clone(),
            table: self.table.clone(),
            timeout_secs: self.timeout_secs,
            log_level: self.log_level.clone(),
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_target(false)
        .with_env_filter(filter)
        .init();
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let file_config = match &cli.config {
        Some(path) => LedgerConfig::load(path)?,
        None => LedgerConfig::default(),
    };
    let settings = cli.overrides().merged_over(file_config).into_settings()?;
    init_tracing(&settings.log_filter);
    debug!(
        db = %settings.db.display(),
        table = %settings.table.name(),
        timeout = ?settings.timeout,
        "resolved settings"
    );

    let ctx = settings.run_context();
    match cli.command {
        Command::Apply(args) => {
            let source = open_source(&args.source.source)?;
            let mut store = SqliteStore::open(&settings.db, settings.table)?;
            if args.dry_run {
                run_plan(&mut store, &ctx, source)
            } else {
                run_apply(&mut store, &ctx, source)
            }
        }
        Command::Status(args) => {
            let source = open_source(&args.source)?;
            let mut store = SqliteStore::open(&settings.db, settings.table)?;
            run_plan(&mut store, &ctx, source)
        }
        Command::Log => {
            let report = if settings.db.exists() {
                SqliteStore::open_read_only(&settings.db, settings.table)?.log_report()?
            } else {
                debug!(db = %settings.db.display(), "database does not exist; log is empty");
                LogReport::empty(&settings.table)
            };
            run_log(&report)
        }
    }
}

fn open_source(path: &Path) -> Result<Box<dyn Read>> {
    if path == Path::new("-") {
        return Ok(Box::new(io::stdin().lock()));
    }
    let file = File::open(path)
        .with_context(|| format!("failed to open statement source {}", path.display()))?;
    Ok(Box::new(BufReader::new(file)))
}

fn run_apply(store: &mut SqliteStore, ctx: &RunContext, source: Box<dyn Read>) -> Result<ExitCode> {
    match store.apply(ctx, source) {
        Ok(report) => {
            emit_json(serde_json::json!({
                "status": "applied",
                "run_id": report.run_id.to_string(),
                "statements_seen": report.statements_seen,
                "skipped": report.skipped,
                "applied": report.applied
            }))?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => emit_failure(&err),
    }
}

fn run_plan(store: &mut SqliteStore, ctx: &RunContext, source: Box<dyn Read>) -> Result<ExitCode> {
    match store.plan(ctx, source) {
        Ok(plan) => {
            emit_json(serde_json::json!({
                "status": "planned",
                "already_applied": plan.already_applied,
                "pending": plan.pending,
                "up_to_date": plan.up_to_date()
            }))?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => emit_failure(&err),
    }
}

fn run_log(report: &LogReport) -> Result<ExitCode> {
    emit_json(serde_json::to_value(report).context("failed to serialize log report")?)?;
    Ok(ExitCode::SUCCESS)
}

fn emit_failure(err: &ReconcileError) -> Result<ExitCode> {
    let kind = err.kind();
    let mut error = Map::new();
    error.insert("kind".to_string(), Value::from(kind.as_str()));
    error.insert("message".to_string(), Value::from(err.to_string()));
    error.insert("sequence".to_string(), Value::from(err.sequence().map(Sequence::get)));
    error.insert("retryable".to_string(), Value::from(kind.is_retryable()));
    error.insert(
        "manual_intervention".to_string(),
        Value::from(kind.requires_manual_intervention()),
    );
    if let Some(stored) = err.stored() {
        error.insert("stored".to_string(), Value::from(stored));
    }
    if let Some(incoming) = err.statement() {
        error.insert("incoming".to_string(), Value::from(incoming));
    }

    emit_json(serde_json::json!({
        "status": "failed",
        "error": error
    }))?;
    Ok(ExitCode::from(RECONCILE_FAILURE_EXIT))
}
