use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use rserv::storage::schema::ValidationMode;
use rserv::{Config, Rserv};
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rserv", version, arg_required_else_help = true)]
struct Cli {
    /// Base directory holding data/ and schema/
    #[arg(long, default_value = ".")]
    db: PathBuf,

    /// Schema name
    #[arg(long)]
    schema: Option<String>,

    /// Optional KEY=value config file (flags and RSERV_* env win over it)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Sulpher query and print result rows as NDJSON
    Query(QueryArgs),
    /// Print graph statistics for the data directory
    Stats,
    /// Re-validate every stored document against its schema
    Validate,
}

#[derive(Parser)]
struct QueryArgs {
    /// Sulpher query string
    #[arg(long, conflicts_with = "file")]
    sulpher: Option<String>,

    /// Read the query from a file
    #[arg(long)]
    file: Option<PathBuf>,

    /// Traversal depth bound
    #[arg(long)]
    max_depth: Option<u32>,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut overrides = vec![(
        "data_dir".to_string(),
        cli.db.display().to_string(),
    )];
    if let Some(schema) = &cli.schema {
        overrides.push(("schema".to_string(), schema.clone()));
    }
    Config::load(cli.config.as_deref(), &overrides).context("loading configuration")
}

fn read_query(args: &QueryArgs) -> anyhow::Result<String> {
    if let Some(query) = &args.sulpher {
        return Ok(query.clone());
    }
    let Some(path) = &args.file else {
        bail!("either --sulpher or --file is required");
    };
    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read query file {}", path.display()))
}

fn run_query(rserv: &Rserv, args: QueryArgs) -> anyhow::Result<()> {
    let query = read_query(&args)?;
    let rows = rserv.run_query(&query, args.max_depth)?;
    let mut stdout = std::io::stdout().lock();
    for row in rows {
        serde_json::to_writer(&mut stdout, &row)?;
        writeln!(stdout)?;
    }
    Ok(())
}

fn run_stats(rserv: &Rserv) -> anyhow::Result<()> {
    let stats = rserv.statistics()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn run_validate(rserv: &Rserv) -> anyhow::Result<()> {
    let store = rserv.store();
    let registry = store.registry();
    let mut failures = 0usize;
    for entity in store.entities()? {
        for id in store.ids(&entity)? {
            let doc = store.get(&entity, id)?;
            let Some(map) = doc.as_object() else {
                eprintln!("{entity}/{id}: not a JSON object");
                failures += 1;
                continue;
            };
            if let Err(errors) = registry.validate(&entity, map, ValidationMode::Replace) {
                failures += 1;
                for e in errors {
                    eprintln!("{entity}/{id}: {}: {}", e.field, e.message);
                }
            }
        }
    }
    if failures > 0 {
        bail!("{failures} document(s) failed validation");
    }
    println!("ok");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let rserv = Rserv::open(config)?;

    match cli.command {
        Commands::Query(args) => run_query(&rserv, args),
        Commands::Stats => run_stats(&rserv),
        Commands::Validate => run_validate(&rserv),
    }
}
