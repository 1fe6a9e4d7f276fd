use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bucket_kernel_core::{
    AssignerConfig, BucketAssigner, IdentityProvider, KeyValueStore, MemoryStore,
    NoIdentityProvider, StageKind, StaticIdentity, StaticSignature, DEFAULT_ASSIGNMENT_KEY,
    DEFAULT_MANUAL_OVERRIDE_KEY,
};
use bucket_kernel_provider::HttpIdentityProvider;
use bucket_kernel_store_sqlite::SqliteKvStore;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "bk")]
#[command(about = "Bucket Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./bucket_kernel.sqlite3")]
    db: PathBuf,

    #[command(flatten)]
    identity: IdentityArgs,

    #[command(flatten)]
    storage: StorageArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct IdentityArgs {
    /// Client network identity; takes precedence over --identity-url.
    #[arg(long, global = true)]
    ip: Option<String>,
    /// JSON endpoint answering `{"ip": "..."}`.
    #[arg(long, global = true)]
    identity_url: Option<String>,
    #[arg(long, global = true, default_value_t = 2_000)]
    identity_timeout_ms: u64,
    #[arg(long, global = true)]
    user_agent: Option<String>,
    /// One of sha256, fnv1a, secure_random, pseudo_random.
    #[arg(long = "disable-stage", global = true, value_parser = parse_stage_kind)]
    disable_stage: Vec<StageKind>,
}

#[derive(Debug, Args)]
struct StorageArgs {
    #[arg(long, global = true, default_value = DEFAULT_ASSIGNMENT_KEY)]
    assignment_key: String,
    #[arg(long, global = true, default_value = DEFAULT_MANUAL_OVERRIDE_KEY)]
    manual_override_key: String,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(flatten)]
    Assignment(AssignmentCommand),
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Subcommand)]
enum AssignmentCommand {
    /// Return the saved bucket, assigning one if none exists.
    Assign,
    /// Compute the hash-based bucket without touching storage.
    Peek,
    /// Show the saved bucket and override flag.
    Show,
    /// Force a bucket and mark it as a manual override.
    SetManual(SetManualArgs),
    /// Remove the saved bucket and override flag, then reassign.
    Clear,
}

#[derive(Debug, Args)]
struct SetManualArgs {
    #[arg(long)]
    bucket: String,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Entries,
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

fn parse_stage_kind(value: &str) -> Result<StageKind, String> {
    StageKind::parse(value).ok_or_else(|| {
        format!("unknown stage {value:?}; expected sha256, fnv1a, secure_random or pseudo_random")
    })
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

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    tracing::debug!(db = %cli.db.display(), "opening kv store");
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteKvStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
        Command::Assignment(command) => {
            let config = assigner_config(&cli.identity, &cli.storage);
            match open_migrated(&cli.db) {
                Ok(store) => {
                    run_assignment(command, &build_assigner(&store, &config, &cli.identity))
                }
                Err(err) => {
                    tracing::warn!(
                        db = %cli.db.display(),
                        error = %format!("{err:#}"),
                        "kv store unavailable; assignment will not persist"
                    );
                    let store = MemoryStore::failing();
                    run_assignment(command, &build_assigner(&store, &config, &cli.identity))
                }
            }
        }
    }
}

fn open_migrated(path: &Path) -> Result<SqliteKvStore> {
    let mut store = SqliteKvStore::open(path)?;
    store.migrate()?;
    Ok(store)
}

fn build_assigner<S: KeyValueStore>(
    kv: S,
    config: &AssignerConfig,
    identity: &IdentityArgs,
) -> BucketAssigner<S> {
    BucketAssigner::with_config(kv, config)
        .with_identity_provider(identity_provider(identity))
        .with_signature_source(Box::new(StaticSignature(identity.user_agent.clone())))
}

fn assigner_config(identity: &IdentityArgs, storage: &StorageArgs) -> AssignerConfig {
    AssignerConfig {
        assignment_key: storage.assignment_key.clone(),
        manual_override_key: storage.manual_override_key.clone(),
        disabled_stages: identity.disable_stage.clone(),
        ..AssignerConfig::default()
    }
}

fn identity_provider(args: &IdentityArgs) -> Box<dyn IdentityProvider> {
    if let Some(ip) = args.ip.as_ref() {
        return Box::new(StaticIdentity(ip.clone()));
    }
    if let Some(url) = args.identity_url.as_ref() {
        let provider =
            HttpIdentityProvider::new(url.clone(), Duration::from_millis(args.identity_timeout_ms));
        tracing::debug!(url = provider.url(), "looking up identity over http");
        return Box::new(provider);
    }
    Box::new(NoIdentityProvider)
}

fn run_assignment<S: KeyValueStore>(
    command: AssignmentCommand,
    assigner: &BucketAssigner<S>,
) -> Result<()> {
    match command {
        AssignmentCommand::Assign => {
            let report = assigner.assign_report();
            emit_json(serde_json::to_value(&report).context("failed to serialize assignment")?)
        }
        AssignmentCommand::Peek => {
            let preview = assigner.peek_report();
            emit_json(serde_json::to_value(&preview).context("failed to serialize preview")?)
        }
        AssignmentCommand::Show => emit_json(serde_json::json!({
            "bucket": assigner.get_saved(),
            "manual_override": assigner.is_manual_override(),
        })),
        AssignmentCommand::SetManual(args) => {
            let bucket = assigner.set_manual(&args.bucket)?;
            emit_json(serde_json::json!({
                "bucket": bucket,
                "manual_override": assigner.is_manual_override(),
            }))
        }
        AssignmentCommand::Clear => {
            let report = assigner.clear_and_reassign_report();
            emit_json(serde_json::to_value(&report).context("failed to serialize assignment")?)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteKvStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Entries => {
            store.migrate()?;
            let entries = store.entries()?;
            emit_json(serde_json::json!({ "entries": entries }))
        }
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteKvStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty(),
    }))
}
