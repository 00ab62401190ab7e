use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use registry_sync_api::config::{
    DEFAULT_DB_PATH, DEFAULT_LIST_PAGE_SIZE, DEFAULT_NATIONALITY, DEFAULT_PAGE_SIZE,
    DEFAULT_SOURCE_URL,
};
use registry_sync_api::{
    run_cycle, ApplyOutcome, DeltaApplier, FileRecordSource, HttpRecordSource, RecordSource, RegistrySyncApi,
    SqliteTransport, SyncConfig,
};
use registry_sync_core::{EntityId, RemoteRecord};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(name = "regsync")]
#[command(about = "Registry sync CLI")]
struct Cli {
    #[arg(long, env = "REGSYNC_DB", default_value = DEFAULT_DB_PATH)]
    db: PathBuf,

    /// Queue database; defaults to the registry database.
    #[arg(long, env = "REGSYNC_QUEUE")]
    queue: Option<PathBuf>,

    #[arg(long, env = "REGSYNC_SOURCE_URL", default_value = DEFAULT_SOURCE_URL)]
    source_url: String,

    #[arg(long, env = "REGSYNC_NATIONALITY", default_value = DEFAULT_NATIONALITY)]
    nationality: String,

    #[arg(long, env = "REGSYNC_POLL_INTERVAL_SECS", default_value_t = 2)]
    poll_interval_secs: u64,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Fetch, classify and publish deltas, then sweep vanished entities.
    Produce(ProduceArgs),
    /// Apply queued deltas.
    Consume(ConsumeArgs),
    /// Classify an NDJSON record file against the store without publishing.
    Classify(ClassifyArgs),
    Entity {
        #[command(subcommand)]
        command: EntityCommand,
    },
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct ProduceArgs {
    /// Run a single cycle and print its report.
    #[arg(long, default_value_t = false)]
    once: bool,
    /// Read records from an NDJSON file instead of the registry API.
    #[arg(long)]
    source_file: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: u32,
}

#[derive(Debug, Args)]
struct ConsumeArgs {
    /// Drain the queue and exit instead of waiting for new messages.
    #[arg(long, default_value_t = false)]
    once: bool,
    /// With --once, stop after the queue stays empty this long.
    #[arg(long, default_value_t = 500)]
    idle_timeout_ms: u64,
}

#[derive(Debug, Args)]
struct ClassifyArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
enum EntityCommand {
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = DEFAULT_LIST_PAGE_SIZE)]
        per_page: u32,
    },
    Show {
        entity_id: String,
    },
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    Status,
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

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

impl Cli {
    fn config(&self) -> SyncConfig {
        let config = SyncConfig::new(&self.db)
            .with_source_url(self.source_url.clone())
            .with_nationality(self.nationality.clone())
            .with_poll_interval(Duration::from_secs(self.poll_interval_secs));
        match &self.queue {
            Some(queue) => config.with_queue_path(queue),
            None => config,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = cli.config();
    let api = RegistrySyncApi::new(cli.db.clone());

    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Produce(args) => run_produce(&args, config),
        Command::Consume(args) => run_consume(&args, &config),
        Command::Classify(args) => run_classify(&args, &api),
        Command::Entity { command } => run_entity(command, &api),
        Command::Queue { command } => run_queue(command, &config),
    }
}

fn run_db(command: DbCommand, api: &RegistrySyncApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::Backup(args) => {
            api.migrate(false)?;
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize integrity report")?,
            )
        }
    }
}

fn open_transport(config: &SyncConfig) -> Result<SqliteTransport> {
    Ok(SqliteTransport::open(&config.queue_path, config.lease)?
        .with_poll_interval(QUEUE_POLL_INTERVAL))
}

fn run_produce(args: &ProduceArgs, config: SyncConfig) -> Result<()> {
    let config = config.with_page_size(args.page_size);
    let transport = open_transport(&config)?;
    let mut source: Box<dyn RecordSource> = match &args.source_file {
        Some(path) => Box::new(FileRecordSource::new(path, config.page_size)),
        None => Box::new(HttpRecordSource::new(&config)),
    };

    if args.once {
        let report =
            run_cycle(&config.db_path, &config.nationality, source.as_mut(), &transport)?;
        return emit_json(serde_json::to_value(&report).context("failed to serialize cycle report")?);
    }

    loop {
        if let Err(err) =
            run_cycle(&config.db_path, &config.nationality, source.as_mut(), &transport)
        {
            let error = format!("{err:#}");
            tracing::error!(%error, "producer cycle failed");
        }
        std::thread::sleep(config.poll_interval);
    }
}

fn run_consume(args: &ConsumeArgs, config: &SyncConfig) -> Result<()> {
    let transport = open_transport(config)?;
    let applier = DeltaApplier::new(&config.db_path);

    if args.once {
        let report = applier.drain(&transport, Duration::from_millis(args.idle_timeout_ms))?;
        return emit_json(serde_json::to_value(report).context("failed to serialize drain report")?);
    }

    tracing::info!(queue = %config.queue_path.display(), "consuming deltas");
    loop {
        match applier.run_once(&transport, config.poll_interval) {
            Ok(Some(ApplyOutcome::Failed { .. })) => std::thread::sleep(config.poll_interval),
            Ok(_) => {}
            Err(err) => {
                let error = format!("{err:#}");
                tracing::error!(%error, "transport receive failed");
                std::thread::sleep(config.poll_interval);
            }
        }
    }
}

fn run_classify(args: &ClassifyArgs, api: &RegistrySyncApi) -> Result<()> {
    let records = read_ndjson_records(&args.file)?;
    let mut deltas = Vec::with_capacity(records.len());
    for (line_no, record) in records {
        let entry = match record {
            Ok(record) => match api.classify_record(record) {
                Ok(delta) => serde_json::json!({ "line": line_no, "delta": delta }),
                Err(err) => serde_json::json!({ "line": line_no, "error": format!("{err:#}") }),
            },
            Err(err) => serde_json::json!({ "line": line_no, "error": err }),
        };
        deltas.push(entry);
    }
    emit_json(serde_json::json!({ "file": args.file, "deltas": deltas }))
}

fn read_ndjson_records(path: &Path) -> Result<Vec<(usize, Result<RemoteRecord, String>)>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read record file {}", path.display()))?;
    Ok(raw
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            (index + 1, serde_json::from_str::<RemoteRecord>(line).map_err(|err| err.to_string()))
        })
        .collect())
}

fn run_entity(command: EntityCommand, api: &RegistrySyncApi) -> Result<()> {
    match command {
        EntityCommand::List { page, per_page } => {
            let listing = api.list_entities(page, per_page)?;
            emit_json(serde_json::to_value(&listing).context("failed to serialize entity page")?)
        }
        EntityCommand::Show { entity_id } => {
            let entity_id = EntityId::from(entity_id.as_str());
            let Some(detail) = api.entity_detail(&entity_id)? else {
                return Err(anyhow!("entity {entity_id} not found"));
            };
            emit_json(serde_json::to_value(&detail).context("failed to serialize entity detail")?)
        }
    }
}

fn run_queue(command: QueueCommand, config: &SyncConfig) -> Result<()> {
    match command {
        QueueCommand::Status => {
            let depth = open_transport(config)?.depth()?;
            emit_json(serde_json::json!({
                "queue_path": config.queue_path,
                "depth": depth
            }))
        }
    }
}
