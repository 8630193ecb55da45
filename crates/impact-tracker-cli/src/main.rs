use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use impact_tracker_api::{NewPrincipal, Page, ParentRef, TrackerApi};
use impact_tracker_core::{
    AttributeMap, AttributionContext, EntityId, EntityKind, JoinId, JoinKind, PrincipalId,
    RequestError, Role, TrackedKind,
};
use serde::Serialize;
use serde_json::{json, Value};
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "impact")]
#[command(about = "Impact Tracker CLI")]
struct Cli {
    #[arg(long, default_value = "./impact_tracker.sqlite3")]
    db: PathBuf,

    /// Principal id to act as; omitted means anonymous.
    #[arg(long = "as", value_name = "PRINCIPAL_ID")]
    acting_as: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Principal {
        #[command(subcommand)]
        command: PrincipalCommand,
    },
    Entity {
        #[command(subcommand)]
        command: EntityCommand,
    },
    Join {
        #[command(subcommand)]
        command: JoinCommand,
    },
    /// Audit trail for one tracked record.
    Versions(VersionsArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum PrincipalCommand {
    Add(PrincipalAddArgs),
    List,
    Archive(PrincipalArchiveArgs),
}

#[derive(Debug, Args)]
struct PrincipalAddArgs {
    #[arg(long)]
    email: String,
    #[arg(long)]
    name: String,
    /// Honored only when acting as an admin; self-signup lands as guest.
    #[arg(long, default_value = "guest")]
    role: String,
}

#[derive(Debug, Args)]
struct PrincipalArchiveArgs {
    id: String,
}

#[derive(Debug, Subcommand)]
enum EntityCommand {
    Add(EntityAddArgs),
    List(EntityListArgs),
    Show(EntityRefArgs),
    Update(EntityUpdateArgs),
    Delete(EntityRefArgs),
}

#[derive(Debug, Args)]
struct EntityAddArgs {
    kind: String,
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    reference: Option<String>,
    #[arg(long)]
    published: Option<bool>,
}

#[derive(Debug, Args)]
struct EntityListArgs {
    kind: String,
    #[arg(long, default_value_t = 20)]
    limit: u32,
    #[arg(long, default_value_t = 0)]
    offset: u32,
    /// Narrow to children of this parent entity kind.
    #[arg(long, requires = "parent_id")]
    parent_kind: Option<String>,
    #[arg(long, requires = "parent_kind")]
    parent_id: Option<String>,
}

#[derive(Debug, Args)]
struct EntityRefArgs {
    kind: String,
    id: String,
}

#[derive(Debug, Args)]
struct EntityUpdateArgs {
    kind: String,
    id: String,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    reference: Option<String>,
    #[arg(long)]
    published: Option<bool>,
    /// Last-seen timestamp; a whole-second mismatch rejects the update.
    #[arg(long)]
    updated_at: Option<String>,
}

#[derive(Debug, Subcommand)]
enum JoinCommand {
    Add(JoinAddArgs),
    List(JoinListArgs),
    Update(JoinUpdateArgs),
    Delete(JoinRefArgs),
}

#[derive(Debug, Args)]
struct JoinAddArgs {
    kind: String,
    /// Id for the kind's first endpoint attribute.
    #[arg(long)]
    left: String,
    /// Id for the kind's second endpoint attribute.
    #[arg(long)]
    right: String,
    #[arg(long)]
    value: Option<String>,
}

#[derive(Debug, Args)]
struct JoinListArgs {
    kind: String,
    #[arg(long, default_value_t = 20)]
    limit: u32,
    #[arg(long, default_value_t = 0)]
    offset: u32,
}

#[derive(Debug, Args)]
struct JoinUpdateArgs {
    kind: String,
    id: String,
    #[arg(long)]
    value: String,
    #[arg(long)]
    updated_at: Option<String>,
}

#[derive(Debug, Args)]
struct JoinRefArgs {
    kind: String,
    id: String,
}

#[derive(Debug, Args)]
struct VersionsArgs {
    kind: String,
    id: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let api = TrackerApi::new(cli.db.clone());
    let ctx = resolve_context(&api, cli.acting_as.as_deref())?;

    match cli.command {
        Command::Db { command } => run_db(&api, command),
        Command::Principal { command } => run_principal(&api, &ctx, command),
        Command::Entity { command } => run_entity(&api, &ctx, command),
        Command::Join { command } => run_join(&api, &ctx, command),
        Command::Versions(args) => run_versions(&api, &ctx, &args),
    }
}

fn resolve_context(api: &TrackerApi, acting_as: Option<&str>) -> Result<AttributionContext> {
    let Some(raw) = acting_as else {
        return Ok(AttributionContext::anonymous());
    };
    let id = PrincipalId::parse(raw).ok_or_else(|| anyhow!("invalid principal id: {raw}"))?;
    let principal = api
        .principal_by_id(id)
        .map_err(request_error)?
        .ok_or_else(|| anyhow!("unknown principal: {raw}"))?;
    Ok(AttributionContext::acting_as(principal))
}

fn run_db(api: &TrackerApi, command: DbCommand) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status().map_err(request_error)?;
            print_payload(&status)
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run).map_err(request_error)?;
            print_payload(&result)
        }
    }
}

fn run_principal(
    api: &TrackerApi,
    ctx: &AttributionContext,
    command: PrincipalCommand,
) -> Result<()> {
    match command {
        PrincipalCommand::Add(args) => {
            let role =
                Role::parse(&args.role).ok_or_else(|| anyhow!("unknown role: {}", args.role))?;
            let principal = api
                .register_principal(
                    ctx,
                    NewPrincipal { email: args.email, name: args.name, role },
                )
                .map_err(request_error)?;
            print_payload(&principal)
        }
        PrincipalCommand::List => {
            let principals = api.list_principals(ctx).map_err(request_error)?;
            print_payload(&principals)
        }
        PrincipalCommand::Archive(args) => {
            let id = PrincipalId::parse(&args.id)
                .ok_or_else(|| anyhow!("invalid principal id: {}", args.id))?;
            api.archive_principal(ctx, id).map_err(request_error)?;
            print_payload(&json!({"archived": args.id}))
        }
    }
}

fn run_entity(api: &TrackerApi, ctx: &AttributionContext, command: EntityCommand) -> Result<()> {
    match command {
        EntityCommand::Add(args) => {
            let kind = parse_entity_kind(&args.kind)?;
            let mut attributes = AttributeMap::new();
            attributes.insert("title".to_string(), Value::String(args.title));
            if let Some(description) = args.description {
                attributes.insert("description".to_string(), Value::String(description));
            }
            if let Some(reference) = args.reference {
                attributes.insert("reference".to_string(), Value::String(reference));
            }
            if let Some(published) = args.published {
                attributes.insert("published".to_string(), Value::Bool(published));
            }
            let entity = api.create_entity(ctx, kind, &attributes).map_err(request_error)?;
            print_payload(&entity)
        }
        EntityCommand::List(args) => {
            let kind = parse_entity_kind(&args.kind)?;
            let parent = match (args.parent_kind.as_deref(), args.parent_id.as_deref()) {
                (Some(parent_kind), Some(parent_id)) => Some(ParentRef {
                    kind: parse_entity_kind(parent_kind)?,
                    id: parse_entity_id(parent_id)?,
                }),
                _ => None,
            };
            let entities = api
                .list_entities(ctx, kind, parent, Page { limit: args.limit, offset: args.offset })
                .map_err(request_error)?;
            print_payload(&entities)
        }
        EntityCommand::Show(args) => {
            let kind = parse_entity_kind(&args.kind)?;
            let entity = api
                .get_entity(ctx, kind, parse_entity_id(&args.id)?)
                .map_err(request_error)?;
            print_payload(&entity)
        }
        EntityCommand::Update(args) => {
            let kind = parse_entity_kind(&args.kind)?;
            let mut attributes = AttributeMap::new();
            if let Some(title) = args.title {
                attributes.insert("title".to_string(), Value::String(title));
            }
            if let Some(description) = args.description {
                attributes.insert("description".to_string(), Value::String(description));
            }
            if let Some(reference) = args.reference {
                attributes.insert("reference".to_string(), Value::String(reference));
            }
            if let Some(published) = args.published {
                attributes.insert("published".to_string(), Value::Bool(published));
            }
            if let Some(updated_at) = args.updated_at {
                attributes.insert("updated_at".to_string(), Value::String(updated_at));
            }
            let entity = api
                .update_entity(ctx, kind, parse_entity_id(&args.id)?, &attributes)
                .map_err(request_error)?;
            print_payload(&entity)
        }
        EntityCommand::Delete(args) => {
            let kind = parse_entity_kind(&args.kind)?;
            api.delete_entity(ctx, kind, parse_entity_id(&args.id)?).map_err(request_error)?;
            print_payload(&json!({"deleted": args.id}))
        }
    }
}

fn run_join(api: &TrackerApi, ctx: &AttributionContext, command: JoinCommand) -> Result<()> {
    match command {
        JoinCommand::Add(args) => {
            let kind = parse_join_kind(&args.kind)?;
            let descriptor = kind.descriptor();
            let mut attributes = AttributeMap::new();
            attributes.insert(descriptor.left_field.to_string(), Value::String(args.left));
            attributes.insert(descriptor.right_field.to_string(), Value::String(args.right));
            if let Some(value) = args.value {
                attributes.insert("value".to_string(), Value::String(value));
            }
            let join = api.create_join(ctx, kind, &attributes).map_err(request_error)?;
            print_payload(&join)
        }
        JoinCommand::List(args) => {
            let kind = parse_join_kind(&args.kind)?;
            let joins = api
                .list_joins(ctx, kind, Page { limit: args.limit, offset: args.offset })
                .map_err(request_error)?;
            print_payload(&joins)
        }
        JoinCommand::Update(args) => {
            let kind = parse_join_kind(&args.kind)?;
            let mut attributes = AttributeMap::new();
            attributes.insert("value".to_string(), Value::String(args.value));
            if let Some(updated_at) = args.updated_at {
                attributes.insert("updated_at".to_string(), Value::String(updated_at));
            }
            let join = api
                .update_join(ctx, kind, parse_join_id(&args.id)?, &attributes)
                .map_err(request_error)?;
            print_payload(&join)
        }
        JoinCommand::Delete(args) => {
            let kind = parse_join_kind(&args.kind)?;
            api.delete_join(ctx, kind, parse_join_id(&args.id)?).map_err(request_error)?;
            print_payload(&json!({"deleted": args.id}))
        }
    }
}

fn run_versions(api: &TrackerApi, ctx: &AttributionContext, args: &VersionsArgs) -> Result<()> {
    let item_type = TrackedKind::parse(&args.kind)
        .ok_or_else(|| anyhow!("unknown tracked kind: {}", args.kind))?;
    let item_id =
        Ulid::from_string(&args.id).map_err(|_| anyhow!("invalid record id: {}", args.id))?;
    let versions = api.versions(ctx, item_type, item_id).map_err(request_error)?;
    print_payload(&versions)
}

fn parse_entity_kind(raw: &str) -> Result<EntityKind> {
    EntityKind::parse(raw).ok_or_else(|| anyhow!("unknown entity kind: {raw}"))
}

fn parse_entity_id(raw: &str) -> Result<EntityId> {
    EntityId::parse(raw).ok_or_else(|| anyhow!("invalid entity id: {raw}"))
}

fn parse_join_kind(raw: &str) -> Result<JoinKind> {
    JoinKind::parse(raw).ok_or_else(|| anyhow!("unknown join kind: {raw}"))
}

fn parse_join_id(raw: &str) -> Result<JoinId> {
    JoinId::parse(raw).ok_or_else(|| anyhow!("invalid join id: {raw}"))
}

fn request_error(err: RequestError) -> anyhow::Error {
    match err {
        RequestError::Validation(errors) => {
            let detail = serde_json::to_string(&errors)
                .unwrap_or_else(|_| "unserializable validation errors".to_string());
            anyhow!("validation failed: {detail}")
        }
        other => anyhow!(other),
    }
}

fn print_payload<T>(data: &T) -> Result<()>
where
    T: Serialize,
{
    let payload = json!({
        "cli_contract_version": CLI_CONTRACT_VERSION,
        "data": data,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}
