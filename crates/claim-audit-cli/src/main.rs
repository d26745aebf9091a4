use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use claim_audit_api::ClaimAuditApi;
use claim_audit_core::{
    Competence, DenialDraft, DenialId, Money, MovementCandidate, MovementKind, RecordDraft,
    RecordId, RecordStatus, Signoff,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ca")]
#[command(about = "Claim audit CLI")]
struct Cli {
    #[arg(long, default_value = "./claim_audit.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Record {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
    Movement {
        #[command(subcommand)]
        command: Box<MovementCommand>,
    },
    Denial {
        #[command(subcommand)]
        command: Box<DenialCommand>,
    },
    Archive {
        #[command(subcommand)]
        command: Box<ArchiveCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
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
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    Create(RecordCreateArgs),
    Show(RecordShowArgs),
    List,
}

#[derive(Debug, Args)]
struct RecordCreateArgs {
    #[arg(long)]
    external_number: String,
    #[arg(long)]
    value: String,
    #[arg(long)]
    competence: String,
    #[arg(long)]
    created_by: String,
    #[arg(long)]
    medicine: Option<String>,
    #[arg(long)]
    nursing: Option<String>,
    #[arg(long)]
    physiotherapy: Option<String>,
    #[arg(long)]
    maxillofacial: Option<String>,
    #[arg(long = "encounter")]
    encounters: Vec<String>,
}

#[derive(Debug, Args)]
struct RecordShowArgs {
    #[arg(long)]
    external_number: String,
}

#[derive(Debug, Subcommand)]
enum MovementCommand {
    Propose(MovementProposeArgs),
}

#[derive(Debug, Args)]
struct MovementProposeArgs {
    #[arg(long)]
    record_id: i64,
    #[arg(long)]
    kind: KindArg,
    #[arg(long)]
    value: String,
    #[arg(long)]
    competence: String,
    #[arg(long)]
    actor: String,
    #[arg(long)]
    status: StatusArg,
    #[arg(long)]
    medicine: Option<String>,
    #[arg(long)]
    nursing: Option<String>,
    #[arg(long)]
    physiotherapy: Option<String>,
    #[arg(long)]
    maxillofacial: Option<String>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Subcommand)]
enum DenialCommand {
    Add(DenialAddArgs),
    Remove(DenialRemoveArgs),
    List(DenialListArgs),
}

#[derive(Debug, Args)]
struct DenialAddArgs {
    #[arg(long)]
    record_id: i64,
    #[arg(long)]
    line: String,
    #[arg(long)]
    kind: String,
    #[arg(long)]
    professional: String,
    #[arg(long, default_value_t = 1)]
    quantity: u32,
}

#[derive(Debug, Args)]
struct DenialRemoveArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
struct DenialListArgs {
    #[arg(long)]
    record_id: i64,
}

#[derive(Debug, Subcommand)]
enum ArchiveCommand {
    Run,
    Lookup(ArchiveLookupArgs),
}

#[derive(Debug, Args)]
struct ArchiveLookupArgs {
    #[arg(long)]
    external_number: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Intake,
    Discharge,
}

impl From<KindArg> for MovementKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Intake => Self::Intake,
            KindArg::Discharge => Self::Discharge,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    FinalizedDirect,
    ActiveIndirect,
    ActiveDiscussion,
    FinalizedAfterDiscussion,
}

impl From<StatusArg> for RecordStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::FinalizedDirect => Self::FinalizedDirect,
            StatusArg::ActiveIndirect => Self::ActiveIndirect,
            StatusArg::ActiveDiscussion => Self::ActiveDiscussion,
            StatusArg::FinalizedAfterDiscussion => Self::FinalizedAfterDiscussion,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let api = ClaimAuditApi::new(cli.db);

    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Record { command } => run_record(*command, &api),
        Command::Movement { command } => run_movement(*command, &api),
        Command::Denial { command } => run_denial(*command, &api),
        Command::Archive { command } => run_archive(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &ClaimAuditApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(result)?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(report)?)
        }
        DbCommand::Backup(args) => {
            api.backup_database(&args.out)?;
            emit_json(serde_json::json!({ "backup": args.out.display().to_string() }))
        }
        DbCommand::Restore(args) => {
            api.restore_database(&args.input)?;
            emit_json(serde_json::json!({ "restored_from": args.input.display().to_string() }))
        }
    }
}

fn run_record(command: RecordCommand, api: &ClaimAuditApi) -> Result<()> {
    match command {
        RecordCommand::Create(args) => {
            let draft = RecordDraft {
                external_number: args.external_number.clone(),
                initial_value: parse_money(&args.value)?,
                competence: parse_competence(&args.competence)?,
                created_by: args.created_by.clone(),
                signoff: Signoff {
                    medicine: args.medicine.clone(),
                    nursing: args.nursing.clone(),
                    physiotherapy: args.physiotherapy.clone(),
                    maxillofacial: args.maxillofacial.clone(),
                },
                encounter_numbers: args.encounters.clone(),
            };
            let record = api.create_record(&draft)?;
            emit_json(serde_json::to_value(record)?)
        }
        RecordCommand::Show(args) => {
            let aggregate = api.lookup_record(&args.external_number)?;
            emit_json(serde_json::to_value(aggregate)?)
        }
        RecordCommand::List => {
            let records = api.list_records()?;
            emit_json(serde_json::json!({ "records": records }))
        }
    }
}

fn run_movement(command: MovementCommand, api: &ClaimAuditApi) -> Result<()> {
    match command {
        MovementCommand::Propose(args) => {
            let candidate = MovementCandidate {
                kind: args.kind.into(),
                actor: args.actor.clone(),
                declared_value: parse_money(&args.value)?,
                competence: parse_competence(&args.competence)?,
                signoff: Signoff {
                    medicine: args.medicine.clone(),
                    nursing: args.nursing.clone(),
                    physiotherapy: args.physiotherapy.clone(),
                    maxillofacial: args.maxillofacial.clone(),
                },
                asserted_status: args.status.into(),
                notes: args.notes.clone(),
            };
            let applied = api.propose_movement(RecordId(args.record_id), &candidate)?;
            emit_json(serde_json::to_value(applied)?)
        }
    }
}

fn run_denial(command: DenialCommand, api: &ClaimAuditApi) -> Result<()> {
    match command {
        DenialCommand::Add(args) => {
            let draft = DenialDraft {
                line_code: args.line.clone(),
                kind: args.kind.clone(),
                professional: args.professional.clone(),
                quantity: args.quantity,
            };
            let denial = api.add_denial(RecordId(args.record_id), &draft)?;
            emit_json(serde_json::to_value(denial)?)
        }
        DenialCommand::Remove(args) => {
            let denial = api.remove_denial(DenialId(args.id))?;
            emit_json(serde_json::to_value(denial)?)
        }
        DenialCommand::List(args) => {
            let denials = api.list_active_denials(RecordId(args.record_id))?;
            emit_json(serde_json::json!({ "denials": denials }))
        }
    }
}

fn run_archive(command: ArchiveCommand, api: &ClaimAuditApi) -> Result<()> {
    match command {
        ArchiveCommand::Run => {
            let summary = api.run_archival_pass()?;
            emit_json(serde_json::to_value(summary)?)
        }
        ArchiveCommand::Lookup(args) => {
            let aggregate = api.lookup_archived(&args.external_number)?;
            emit_json(serde_json::to_value(aggregate)?)
        }
    }
}

fn parse_money(raw: &str) -> Result<Money> {
    Money::parse(raw).ok_or_else(|| anyhow!("invalid monetary value: {raw}"))
}

fn parse_competence(raw: &str) -> Result<Competence> {
    Competence::parse(raw).ok_or_else(|| anyhow!("invalid competence (expected MM/YYYY): {raw}"))
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
