use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use doc_sequencer::infra::{
    Allocator, DefinitionAdmin, DefinitionRepository, PgSequenceStore, SequenceStore,
    SqliteSequenceStore,
};
use doc_sequencer::server::Backend;
use doc_sequencer::{DocumentType, TenantId};

fn print_help() {
    eprintln!(
        "\
doc-sequencer-admin

USAGE:
  doc-sequencer-admin <command> [options]

COMMANDS:
  migrate                         Run database migrations
  list                            List the sequence definitions of a tenant
  create                          Create a sequence definition
  allocate                        Allocate the next number of a sequence

COMMON OPTIONS:
  --database-url <url>            postgres://... or sqlite:... (defaults to env DATABASE_URL)

list OPTIONS:
  --tenant-id <uuid>              (required)

create OPTIONS:
  --tenant-id <uuid>              (required)
  --document-type <name>          (required) e.g. Invoice, Receipt, Admission
  --padding <n>                   (required) Minimum digit width, 1-32
  --prefix <text>                 (default: empty)
  --reset-every-year              (optional) Restart at 1 each calendar year (UTC)

allocate OPTIONS:
  --tenant-id <uuid>              (required)
  --document-type <name>          (required)
"
    );
}

fn require_database_url(database_url: Option<String>) -> anyhow::Result<String> {
    database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required (or pass --database-url)"))
}

fn take_value(args: &mut VecDeque<String>, flag: &str) -> anyhow::Result<String> {
    args.pop_front()
        .ok_or_else(|| anyhow::anyhow!("missing value for {flag}"))
}

/// Store opened for one admin command; migrations are always applied first.
struct Store {
    sequences: Arc<dyn SequenceStore>,
    definitions: Arc<dyn DefinitionRepository>,
}

async fn open_store(database_url: &str) -> anyhow::Result<Store> {
    match Backend::from_url(database_url)? {
        Backend::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(database_url)
                .await?;
            doc_sequencer::migrations::run_postgres(&pool).await?;
            let store = Arc::new(PgSequenceStore::new(pool));
            Ok(Store {
                sequences: store.clone(),
                definitions: store,
            })
        }
        Backend::Sqlite => {
            let pool =
                SqliteSequenceStore::connect(database_url, 5, Duration::from_secs(5)).await?;
            doc_sequencer::migrations::run_sqlite(&pool).await?;
            let store = Arc::new(SqliteSequenceStore::new(pool));
            Ok(Store {
                sequences: store.clone(),
                definitions: store,
            })
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args: VecDeque<String> = std::env::args().skip(1).collect();
    let Some(command) = args.pop_front() else {
        print_help();
        return Ok(());
    };

    if matches!(command.as_str(), "-h" | "--help" | "help") {
        print_help();
        return Ok(());
    }

    let mut database_url: Option<String> = None;
    let mut tenant_id: Option<Uuid> = None;
    let mut document_type: Option<String> = None;
    let mut prefix = String::new();
    let mut padding: Option<u32> = None;
    let mut reset_every_year = false;

    while let Some(arg) = args.pop_front() {
        match arg.as_str() {
            "--database-url" => database_url = Some(take_value(&mut args, &arg)?),
            "--tenant-id" => {
                tenant_id = Some(Uuid::parse_str(&take_value(&mut args, &arg)?)?);
            }
            "--document-type" => document_type = Some(take_value(&mut args, &arg)?),
            "--prefix" => prefix = take_value(&mut args, &arg)?,
            "--padding" => padding = Some(take_value(&mut args, &arg)?.parse()?),
            "--reset-every-year" => reset_every_year = true,
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            other => anyhow::bail!("unexpected argument: {other}"),
        }
    }

    let database_url = require_database_url(database_url)?;
    let require_tenant = || {
        tenant_id
            .map(TenantId::from_uuid)
            .ok_or_else(|| anyhow::anyhow!("--tenant-id is required"))
    };
    let require_document_type = || {
        document_type
            .clone()
            .map(DocumentType::from)
            .ok_or_else(|| anyhow::anyhow!("--document-type is required"))
    };

    match command.as_str() {
        "migrate" => {
            open_store(&database_url).await?;
            println!("ok: migrations applied");
            Ok(())
        }
        "list" => {
            let tenant_id = require_tenant()?;
            let store = open_store(&database_url).await?;
            let admin = DefinitionAdmin::new(store.definitions);

            let definitions = admin.list(&tenant_id).await?;
            if definitions.is_empty() {
                println!("no definitions for tenant {tenant_id}");
            }
            for def in definitions {
                println!(
                    "{}\t{}\tprefix={:?}\tpadding={}\treset_every_year={}\tlast={}\tyear={}",
                    def.id,
                    def.document_type,
                    def.prefix,
                    def.padding,
                    def.reset_every_year,
                    def.last_number,
                    def.last_generated_year
                );
            }
            Ok(())
        }
        "create" => {
            let tenant_id = require_tenant()?;
            let document_type = require_document_type()?;
            let padding = padding.ok_or_else(|| anyhow::anyhow!("--padding is required"))?;
            let store = open_store(&database_url).await?;
            let admin = DefinitionAdmin::new(store.definitions);

            let created = admin
                .create(tenant_id, document_type, prefix, padding, reset_every_year)
                .await?;
            println!("ok: created {} ({})", created.id, created.key());
            Ok(())
        }
        "allocate" => {
            let tenant_id = require_tenant()?;
            let document_type = require_document_type()?;
            let store = open_store(&database_url).await?;
            let allocator = Allocator::new(store.sequences);

            let allocated = allocator
                .allocate_next_with_retry(&tenant_id, &document_type)
                .await?;
            println!("{}", allocated.formatted_number);
            Ok(())
        }
        other => {
            print_help();
            anyhow::bail!("unknown command: {other}")
        }
    }
}
