use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use scroll_vault_api::ScrollVaultApi;
use scroll_vault_core::wire::{
    CyclePayload, CycleView, IngestResponse, PatchPayload, ProvenanceView,
};
use scroll_vault_core::{CycleDraft, CycleFilter, CyclePatch, IngestOrigin};
use serde::de::DeserializeOwned;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const CLI_SOURCE_ADDRESS: &str = "cli";

#[derive(Debug, Parser)]
#[command(name = "sv")]
#[command(about = "Scroll Vault CLI")]
struct Cli {
    #[arg(long, env = "SCROLL_VAULT_DB", default_value = "./scroll_vault.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Cycle {
        #[command(subcommand)]
        command: CycleCommand,
    },
    Query {
        #[command(subcommand)]
        command: QueryCommand,
    },
    Archive {
        #[command(subcommand)]
        command: ArchiveCommand,
    },
    Provenance {
        #[command(subcommand)]
        command: ProvenanceCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Subcommand)]
enum CycleCommand {
    /// Deduplicating write; logs provenance for every attempt.
    Ingest(IngestArgs),
    /// Direct write; `--bulk` reads an array and stores all or nothing.
    Create(CreateArgs),
    Get(GetArgs),
    Latest,
    List(LimitArgs),
    Patch(PatchArgs),
}

#[derive(Debug, Args)]
struct PayloadArgs {
    /// JSON payload file, or `-` for stdin.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[command(flatten)]
    payload: PayloadArgs,
    #[arg(long, default_value = CLI_SOURCE_ADDRESS)]
    source_address: String,
    #[arg(long)]
    node_id: Option<String>,
}

#[derive(Debug, Args)]
struct CreateArgs {
    #[command(flatten)]
    payload: PayloadArgs,
    #[arg(long, default_value_t = false)]
    bulk: bool,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct GetArgs {
    #[arg(long)]
    signifier: Option<String>,
    #[arg(long)]
    hash: Option<String>,
}

#[derive(Debug, Args)]
struct LimitArgs {
    #[arg(long)]
    limit: Option<u32>,
}

#[derive(Debug, Args)]
struct PatchArgs {
    #[arg(long)]
    signifier: String,
    #[command(flatten)]
    payload: PayloadArgs,
}

#[derive(Debug, Subcommand)]
enum QueryCommand {
    Filter(FilterArgs),
    Aggregate(AggregateArgs),
    Search(SearchArgs),
    Stats,
}

#[derive(Debug, Args)]
struct FilterArgs {
    #[arg(long)]
    ache_min: Option<f64>,
    #[arg(long)]
    ache_max: Option<f64>,
    #[arg(long)]
    drift_min: Option<f64>,
    #[arg(long)]
    drift_max: Option<f64>,
    #[arg(long)]
    entropy_min: Option<f64>,
    #[arg(long)]
    entropy_max: Option<f64>,
    #[arg(long, allow_negative_numbers = true)]
    t_min: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    t_max: Option<i64>,
    #[arg(long)]
    limit: Option<u32>,
}

#[derive(Debug, Args)]
struct AggregateArgs {
    #[arg(long, allow_negative_numbers = true)]
    window: Option<i64>,
    #[arg(long)]
    limit: Option<u32>,
}

#[derive(Debug, Args)]
struct SearchArgs {
    #[arg(long)]
    keyword: String,
    #[arg(long)]
    limit: Option<u32>,
}

#[derive(Debug, Subcommand)]
enum ArchiveCommand {
    Export(ArchiveExportArgs),
}

#[derive(Debug, Args)]
struct ArchiveExportArgs {
    /// Output file, or an existing directory to write the generated file name into.
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ProvenanceCommand {
    List(LimitArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    IntegrityCheck,
}

impl From<FilterArgs> for CycleFilter {
    fn from(args: FilterArgs) -> Self {
        Self {
            ache_min: args.ache_min,
            ache_max: args.ache_max,
            drift_min: args.drift_min,
            drift_max: args.drift_max,
            entropy_min: args.entropy_min,
            entropy_max: args.entropy_max,
            t_min: args.t_min,
            t_max: args.t_max,
            limit: args.limit,
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

fn emit<T: serde::Serialize>(value: &T) -> Result<()> {
    let value = serde_json::to_value(value).context("failed to serialize command output")?;
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn read_payload<T: DeserializeOwned>(args: &PayloadArgs) -> Result<T> {
    let body = if args.file.as_os_str() == "-" {
        let mut body = String::new();
        std::io::stdin().read_to_string(&mut body).context("failed to read payload from stdin")?;
        body
    } else {
        fs::read_to_string(&args.file)
            .with_context(|| format!("failed to read payload file {}", args.file.display()))?
    };
    serde_json::from_str(&body)
        .with_context(|| format!("invalid payload in {}", args.file.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = ScrollVaultApi::new(cli.db);
    match cli.command {
        Command::Cycle { command } => run_cycle(command, &api),
        Command::Query { command } => run_query(command, &api),
        Command::Archive { command } => run_archive(command, &api),
        Command::Provenance { command } => run_provenance(command, &api),
        Command::Db { command } => run_db(command, &api),
    }
}

fn run_cycle(command: CycleCommand, api: &ScrollVaultApi) -> Result<()> {
    match command {
        CycleCommand::Ingest(args) => {
            let payload: CyclePayload = read_payload(&args.payload)?;
            let origin = IngestOrigin::new(args.source_address, args.node_id);
            let receipt = api.ingest(&CycleDraft::from(payload), &origin)?;
            emit(&IngestResponse::from(&receipt))
        }
        CycleCommand::Create(args) if args.bulk => {
            let payloads: Vec<CyclePayload> = read_payload(&args.payload)?;
            let drafts = payloads.into_iter().map(CycleDraft::from).collect::<Vec<_>>();
            let cycles = api.create_cycles(&drafts)?;
            emit(&cycles.iter().map(CycleView::from).collect::<Vec<_>>())
        }
        CycleCommand::Create(args) => {
            let payload: CyclePayload = read_payload(&args.payload)?;
            let cycle = api.create_cycle(&CycleDraft::from(payload))?;
            emit(&CycleView::from(&cycle))
        }
        CycleCommand::Get(args) => {
            let cycle = match (args.signifier, args.hash) {
                (Some(signifier), _) => api.get_by_signifier(&signifier)?,
                (None, Some(hash)) => api.get_by_hash(&hash)?,
                (None, None) => anyhow::bail!("one of --signifier or --hash is required"),
            };
            emit(&CycleView::from(&cycle))
        }
        CycleCommand::Latest => emit(&CycleView::from(&api.latest()?)),
        CycleCommand::List(args) => {
            let cycles = api.list(args.limit)?;
            emit(&cycles.iter().map(CycleView::from).collect::<Vec<_>>())
        }
        CycleCommand::Patch(args) => {
            let payload: PatchPayload = read_payload(&args.payload)?;
            let patched = api.patch(&args.signifier, &CyclePatch::from(payload))?;
            emit(&CycleView::from(&patched))
        }
    }
}

fn run_query(command: QueryCommand, api: &ScrollVaultApi) -> Result<()> {
    match command {
        QueryCommand::Filter(args) => {
            let cycles = api.query(&CycleFilter::from(args))?;
            emit(&cycles.iter().map(CycleView::from).collect::<Vec<_>>())
        }
        QueryCommand::Aggregate(args) => emit(&api.aggregate(args.window, args.limit)?),
        QueryCommand::Search(args) => {
            let cycles = api.search(&args.keyword, args.limit)?;
            emit(&cycles.iter().map(CycleView::from).collect::<Vec<_>>())
        }
        QueryCommand::Stats => emit(&api.stats()?),
    }
}

fn run_archive(command: ArchiveCommand, api: &ScrollVaultApi) -> Result<()> {
    match command {
        ArchiveCommand::Export(args) => {
            let export = api.export_archive()?;
            let path = archive_target(&args.out, &export.file_name);
            fs::write(&path, &export.bytes)
                .with_context(|| format!("failed to write archive {}", path.display()))?;
            emit(&serde_json::json!({
                "path": path.display().to_string(),
                "records": export.records,
                "bytes": export.bytes.len(),
            }))
        }
    }
}

fn archive_target(out: &Path, file_name: &str) -> PathBuf {
    if out.is_dir() {
        out.join(file_name)
    } else {
        out.to_path_buf()
    }
}

fn run_provenance(command: ProvenanceCommand, api: &ScrollVaultApi) -> Result<()> {
    match command {
        ProvenanceCommand::List(args) => {
            let entries = api.provenance(args.limit)?;
            emit(&entries.iter().map(ProvenanceView::from).collect::<Vec<_>>())
        }
    }
}

fn run_db(command: DbCommand, api: &ScrollVaultApi) -> Result<()> {
    match command {
        DbCommand::IntegrityCheck => emit(&api.integrity_check()?),
    }
}
