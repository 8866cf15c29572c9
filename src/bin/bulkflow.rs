use bulkflow::{
    AuditOptions, BatchOptions, EntityRegistry, ImportContext, SchemaPlan, SequenceKey,
    SequenceSource, Store, TenantScope, WithContext, csv_import::CsvOptions, metrics,
};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::{fs::File, io::BufReader, path::PathBuf};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "bulkflow", version, about = "Bulkflow CLI")]
struct Cli {
    /// Postgres connection string. Falls back to DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,

    /// Base schema to manage (default: public)
    #[arg(long, default_value = "public")]
    schema: String,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show planned DDL changes without applying
    SchemaPlan,

    /// Apply DDL changes (create schemas/tables/indexes as needed)
    SchemaSync,

    /// List configured entity types
    Entities {
        /// JSON file with entity configs (default: built-in ERP entities)
        #[arg(long)]
        entities_config: Option<PathBuf>,
    },

    /// Import a JSON array or CSV file of records for one entity type
    Import {
        #[arg(long)]
        entity: String,

        #[arg(long)]
        client: String,

        #[arg(long)]
        company: Option<String>,

        /// Recorded as created_by on every record
        #[arg(long)]
        actor: Option<String>,

        /// `.csv` files are read as CSV, anything else as a JSON array
        #[arg(long)]
        file: PathBuf,

        #[arg(long, default_value_t = bulkflow::batch::DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        /// Chunks inserted concurrently per wave
        #[arg(long, default_value_t = 1)]
        concurrency: usize,

        #[arg(long)]
        entities_config: Option<PathBuf>,

        /// Print counters in Prometheus text format after the report
        #[arg(long)]
        metrics: bool,
    },

    /// Reserve a range of sequence values
    NextRange {
        #[arg(long)]
        scope: String,

        #[arg(long)]
        entity: String,

        #[arg(long, default_value_t = 1)]
        count: u32,
    },
}

#[tokio::main]
async fn main() -> bulkflow::Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    if let Commands::Entities { entities_config } = &cli.command {
        let registry = load_registry(entities_config.as_ref())?;
        for name in registry.entity_types() {
            let config = registry.get(name)?;
            println!("{}\t{}", name, config.collection);
        }
        return Ok(());
    }

    let url = match cli
        .database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
    {
        Some(u) => u,
        None => {
            eprintln!("error: --database-url or env DATABASE_URL is required");
            std::process::exit(2);
        }
    };

    let store = Store::builder(url).base_schema(cli.schema).build().await?;
    let config = store.schema_config();
    let mgr = store.schema();

    match cli.command {
        Commands::SchemaPlan => {
            let plan = mgr.plan(&config).await?;
            print_plan(&plan);
        }
        Commands::SchemaSync => {
            let plan = mgr.sync(&config).await?;
            if plan.is_empty() {
                println!("No changes needed.");
            } else {
                println!("Applied changes:");
                print_plan(&plan);
            }
        }
        Commands::Entities { .. } => {}
        Commands::Import {
            entity,
            client,
            company,
            actor,
            file,
            batch_size,
            concurrency,
            entities_config,
            metrics: print_metrics,
        } => {
            let registry = load_registry(entities_config.as_ref())?;
            let tenant = match company {
                Some(company) => TenantScope::company(client, company),
                None => TenantScope::client(client),
            };
            let mut ctx = ImportContext::builder(tenant);
            if let Some(actor) = actor {
                ctx = ctx.actor(actor);
            }
            let mut ctx = ctx.build();
            ctx.merge_headers(serde_json::json!({ "source_file": file.display().to_string() }));

            let audit = store.audit_log(AuditOptions::default());
            let importer = store
                .importer(registry)
                .with_options(
                    BatchOptions::default()
                        .batch_size(batch_size)
                        .concurrency(concurrency),
                )
                .with_audit(audit.clone());

            let reader = BufReader::new(
                File::open(&file).context(format!("opening {}", file.display()))?,
            );
            let is_csv = file
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
            let report = if is_csv {
                importer
                    .import_csv(&ctx, &entity, reader, CsvOptions::default())
                    .await
                    .context(format!("importing {}", file.display()))?
            } else {
                let records: Vec<Value> = serde_json::from_reader(reader)
                    .context(format!("parsing {} as a JSON array", file.display()))?;
                importer.import(&ctx, &entity, records).await?
            };
            drop(importer);
            audit.shutdown().await;

            println!("{}", serde_json::to_string_pretty(&report)?);
            if print_metrics {
                print!("{}", metrics::render_prometheus());
            }
        }
        Commands::NextRange {
            scope,
            entity,
            count,
        } => {
            let range = store
                .sequences()
                .next_range(&SequenceKey::new(scope, entity), count)
                .await?;
            println!("{} {}", range.start, range.end);
        }
    }

    Ok(())
}

fn load_registry(path: Option<&PathBuf>) -> bulkflow::Result<EntityRegistry> {
    match path {
        Some(path) => EntityRegistry::from_json_file(path),
        None => Ok(EntityRegistry::erp_defaults()),
    }
}

fn print_plan(plan: &SchemaPlan) {
    if !plan.warnings().is_empty() {
        eprintln!("Warnings ({}):", plan.warnings().len());
        for w in plan.warnings() {
            eprintln!("  - {}", w);
        }
    }

    if plan.actions().is_empty() {
        println!("No pending DDL actions.");
        return;
    }

    println!("DDL actions ({}):", plan.actions().len());
    for (i, action) in plan.actions().iter().enumerate() {
        println!("{}. {}", i + 1, action.description());
        println!("{}\n", action.sql());
    }
}
