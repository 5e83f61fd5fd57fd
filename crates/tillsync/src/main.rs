//! tillsync CLI
//!
//! Thin wrapper over `tillsync-core`: append records, list them, run sync
//! passes, run the background poller, and report status.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use tillsync_core::config::{Config, LogFormat};
use tillsync_core::error::{ConfigError, Remediation};
use tillsync_core::ledger::Ledger;
use tillsync_core::logging::{LogError, init_logging};
use tillsync_core::mirror::{MirrorClient, MirrorStatus};
use tillsync_core::scheduler::{KindOutcome, KindSyncResult, SyncEngine, SyncOptions, spawn_poller};
use tillsync_core::schema::{self, Row};
use tillsync_core::{Record, RecordKind, SyncMode};

#[derive(Parser, Debug)]
#[command(name = "tillsync", version, about = "Bakery ledger with a two-way spreadsheet mirror")]
struct Cli {
    /// Config file (default: ./tillsync.toml when present)
    #[arg(long, global = true, env = "TILLSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Override general.data_dir
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `tillsync_core=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format on stderr
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Output format on stdout
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Plain)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record a new bookkeeping fact
    Append {
        /// Record kind (sale, expense, credit, credit_payment, order, ...)
        kind: RecordKind,

        /// Business date; blank means today. Accepts YYYY-MM-DD or dd/mm/yyyy.
        #[arg(long)]
        date: Option<String>,

        /// Field values as a JSON object keyed by column name
        #[arg(long, default_value = "{}")]
        json: String,
    },

    /// Print stored records of one kind
    List {
        kind: RecordKind,

        /// Only this business date
        #[arg(long)]
        date: Option<String>,
    },

    /// Reconcile the ledger with the mirror
    Sync {
        /// Comma-separated kinds (default: all)
        #[arg(long, value_delimiter = ',')]
        kinds: Vec<RecordKind>,

        #[arg(long, default_value_t = SyncMode::Both)]
        mode: SyncMode,

        /// Drop records the other side no longer has
        #[arg(long)]
        allow_delete: bool,
    },

    /// Run background pull passes until interrupted
    Watch {
        /// Seconds between passes (default: sync.poll_interval_secs)
        #[arg(long)]
        interval: Option<u64>,

        #[arg(long)]
        allow_delete: bool,
    },

    /// Show mirror reachability and ledger sizes
    Status,
}

struct App {
    config: Config,
    engine: Arc<SyncEngine>,
}

impl App {
    fn open(config: Config) -> anyhow::Result<Self> {
        let store = tillsync_core::LedgerStore::open(&config.general.data_dir).with_context(|| {
            format!("opening ledger under {}", config.general.data_dir.display())
        })?;
        let mirror =
            MirrorClient::from_config(&config.mirror).context("configuring the remote mirror")?;
        let engine = SyncEngine::new(Arc::new(store), Arc::new(mirror), config.clock());
        Ok(Self {
            config,
            engine: Arc::new(engine),
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(remediation) = remediation_for(&err) {
                eprint!("{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

fn remediation_for(err: &anyhow::Error) -> Option<Remediation> {
    if let Some(e) = err.downcast_ref::<tillsync_core::Error>() {
        return e.remediation();
    }
    err.downcast_ref::<ConfigError>().map(ConfigError::remediation)
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        config.general.data_dir.clone_from(dir);
    }
    if let Some(level) = &cli.log_level {
        config.log.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.log.format = format;
    }
    match init_logging(&config.log) {
        Ok(()) | Err(LogError::AlreadyInitialized) => {}
        Err(e) => return Err(e).context("initializing logging"),
    }

    let app = App::open(config)?;
    match cli.command {
        Commands::Append { kind, date, json } => append(&app, kind, date, &json, cli.format).await,
        Commands::List { kind, date } => list(&app, kind, date, cli.format).await,
        Commands::Sync {
            kinds,
            mode,
            allow_delete,
        } => sync(&app, kinds, mode, allow_delete, cli.format).await,
        Commands::Watch {
            interval,
            allow_delete,
        } => watch(&app, interval, allow_delete).await,
        Commands::Status => status(&app, cli.format).await,
    }
}

fn payload_row(json: &str) -> anyhow::Result<Row> {
    let value: Value = serde_json::from_str(json).context("--json is not valid JSON")?;
    let Value::Object(fields) = value else {
        bail!("--json must be a JSON object");
    };
    Ok(fields
        .into_iter()
        .map(|(key, value)| (schema::header_key(&key), value))
        .collect())
}

async fn append(
    app: &App,
    kind: RecordKind,
    date: Option<String>,
    json: &str,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    let row = payload_row(json)?;
    let date = date.map_or_else(
        || {
            row.get("business_date")
                .or_else(|| row.get("date"))
                .cloned()
                .unwrap_or(Value::Null)
        },
        Value::String,
    );
    let payload = schema::payload_from_row(kind, &row);

    let (ledger, worker) = Ledger::with_mirror(
        Arc::clone(app.engine.store()),
        app.config.clock(),
        Arc::clone(app.engine.mirror()),
        app.engine.pass_locks(),
    );
    let outcome = ledger.append(payload, &date).await?;
    drop(ledger);
    if let Some(worker) = worker {
        let stats = worker.join().await;
        if stats.failed > 0 {
            eprintln!("note: stored locally, but the mirror append failed; `tillsync sync` will push it");
        }
    }

    match format {
        OutputFormat::Json => print_json(&outcome.record())?,
        OutputFormat::Plain => {
            let verb = if outcome.is_deduplicated() {
                "duplicate of"
            } else {
                "appended"
            };
            let record = outcome.record();
            println!("{verb} {} {} ({})", record.kind(), record.id, record.date);
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn list(
    app: &App,
    kind: RecordKind,
    date: Option<String>,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    let store = app.engine.store();
    let records: Vec<Record> = match date {
        Some(date) => {
            let date = tillsync_core::codec::parse_date_str(&date, &app.config.clock());
            store.read_day(kind, &date).await?
        }
        None => store.read_all(kind).await?,
    };
    match format {
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Plain => {
            for record in &records {
                let mut fields = serde_json::to_value(&record.payload)?;
                if let Value::Object(map) = &mut fields {
                    map.remove("kind");
                }
                println!("{}\t{}\t{}", record.id, record.date, fields);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn sync(
    app: &App,
    kinds: Vec<RecordKind>,
    mode: SyncMode,
    allow_delete: bool,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    let kinds = if kinds.is_empty() {
        RecordKind::ALL.to_vec()
    } else {
        kinds
    };
    let results = app
        .engine
        .sync_many(&kinds, SyncOptions { mode, allow_delete })
        .await;

    match format {
        OutputFormat::Json => print_json(&results)?,
        OutputFormat::Plain => {
            for result in &results {
                println!("{}", describe(result));
            }
        }
    }
    Ok(if results.iter().any(KindSyncResult::is_failed) {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

fn describe(result: &KindSyncResult) -> String {
    match &result.outcome {
        KindOutcome::Synced { summary } => format!(
            "{:<15} ok      pulled={} pushed={} updated={} deleted={} conflicts={} total={}",
            result.kind,
            summary.pulled,
            summary.pushed,
            summary.updated,
            summary.deleted,
            summary.conflicts,
            summary.total
        ),
        KindOutcome::Skipped => format!("{:<15} skipped (pass already running)", result.kind),
        KindOutcome::Failed { error } => format!("{:<15} failed  {error}", result.kind),
    }
}

async fn watch(app: &App, interval: Option<u64>, allow_delete: bool) -> anyhow::Result<ExitCode> {
    let interval = interval
        .map(Duration::from_secs)
        .or_else(|| app.config.poll_interval())
        .filter(|d| !d.is_zero());
    let Some(interval) = interval else {
        bail!("no poll interval: pass --interval or set sync.poll_interval_secs");
    };
    if !app.engine.mirror().is_enabled() {
        bail!(tillsync_core::Error::from(tillsync_core::MirrorError::Disabled));
    }
    let allow_delete = allow_delete || app.config.sync.poll_allow_delete;
    let Some(poller) = spawn_poller(Arc::clone(&app.engine), interval, allow_delete) else {
        bail!("background sync could not be started");
    };
    info!(
        interval_secs = interval.as_secs(),
        allow_delete, "watching mirror; press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    poller.shutdown().await;
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct StatusReport {
    version: &'static str,
    data_dir: String,
    mirror: MirrorStatus,
    poll_interval_secs: u64,
    ledger: BTreeMap<RecordKind, usize>,
}

async fn status(app: &App, format: OutputFormat) -> anyhow::Result<ExitCode> {
    let report = StatusReport {
        version: tillsync_core::VERSION,
        data_dir: app.config.general.data_dir.display().to_string(),
        mirror: app.engine.mirror().status().await,
        poll_interval_secs: app.config.sync.poll_interval_secs,
        ledger: app.engine.store().counts().await?.into_iter().collect(),
    };
    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Plain => {
            println!("tillsync {}", report.version);
            println!("data dir:  {}", report.data_dir);
            let mirror = match (&report.mirror, report.mirror.enabled) {
                (_, false) => "disabled".to_string(),
                (m, true) if m.reachable => format!("reachable ({} tables)", m.tables.len()),
                (m, true) => format!(
                    "unreachable: {}",
                    m.error.as_deref().unwrap_or("unknown error")
                ),
            };
            println!("mirror:    {mirror}");
            println!(
                "poller:    {}",
                if report.poll_interval_secs == 0 {
                    "off".to_string()
                } else {
                    format!("every {}s", report.poll_interval_secs)
                }
            );
            for (kind, count) in &report.ledger {
                println!("  {:<15} {count}", kind.as_str());
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
