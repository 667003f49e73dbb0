//! # Shoebox CLI (`sbx`)
//!
//! The `sbx` binary is the primary interface for Shoebox. It provides
//! commands for database initialization, export discovery, ingestion,
//! and import-run inspection.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sbx init` | Create the SQLite database and run schema migrations |
//! | `sbx sources` | List supported data sources and how to obtain exports |
//! | `sbx discover <path>` | Probe an export without importing it |
//! | `sbx ingest <path>` | Import an export (archive, file, or directory) |
//! | `sbx runs` | List recent import runs |
//! | `sbx show <run-id>` | Show one import run in detail |
//! | `sbx cancel <run-id>` | Cancel an unfinished import run |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! sbx init --config ./config/shoebox.toml
//!
//! # See what an export contains before importing
//! sbx discover ~/Downloads/takeout-2024.zip
//!
//! # Import only emails and notes, bounded by date
//! sbx ingest ~/exports/mail.mbox --types email --since 2023-01-01
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use shoebox::config::{load_config, Config};
use shoebox::coordinator::IngestionCoordinator;
use shoebox::discover::{discover, list_sources};
use shoebox::generic::GenericIngester;
use shoebox::hash::check_duplicate;
use shoebox::hooks::{HookRegistry, LoggingHook};
use shoebox::ingester::{Ingester, IngestionFilter};
use shoebox::jobs::cancel_import;
use shoebox::models::{EntityKind, ImportRun};
use shoebox::parsers::parse_datetime;
use shoebox::progress::LoggingProgress;
use shoebox::registry::IngesterRegistry;
use shoebox::store::{IngestionStore, SqliteStore};
use shoebox::{db, migrate};

/// Shoebox CLI — a local-first aggregator for personal data exports.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/shoebox.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "sbx",
    about = "Shoebox — a local-first aggregator for personal data exports",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/shoebox.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// List supported data sources and acquisition instructions.
    Sources,

    /// Probe an export without importing anything.
    ///
    /// Reports the matched source type (or generic) and the entity kinds
    /// found with approximate counts.
    Discover {
        /// Path to an archive, file, or directory.
        path: PathBuf,
    },

    /// Import an export into the store.
    Ingest {
        /// Path to an archive, file, or directory.
        path: PathBuf,

        /// Comma-separated entity kinds to import (default: all found).
        /// Example: `--types media,email,knowledge_note`.
        #[arg(long)]
        types: Option<String>,

        /// Only import entities occurring on or after this datetime.
        #[arg(long)]
        since: Option<String>,

        /// Only import entities occurring before this datetime.
        #[arg(long)]
        until: Option<String>,
    },

    /// List recent import runs.
    Runs {
        /// Maximum number of runs to show.
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Show one import run in detail.
    Show {
        /// Import run UUID.
        run_id: String,
    },

    /// Cancel an unfinished import run.
    Cancel {
        /// Import run UUID.
        run_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => cmd_init(&config).await,
        Commands::Sources => cmd_sources(),
        Commands::Discover { path } => cmd_discover(&path),
        Commands::Ingest {
            path,
            types,
            since,
            until,
        } => cmd_ingest(&config, &path, types, since, until).await,
        Commands::Runs { limit } => cmd_runs(&config, limit).await,
        Commands::Show { run_id } => cmd_show(&config, &run_id).await,
        Commands::Cancel { run_id } => cmd_cancel(&config, &run_id).await,
    }
}

async fn open_store(config: &Config) -> Result<SqliteStore> {
    let pool = db::connect(config).await?;
    Ok(SqliteStore::new(pool))
}

/// Registry of source-specific ingesters. Third-party adapters register
/// here at startup; the generic fallback is not pattern-matched.
fn build_registry() -> Result<IngesterRegistry> {
    let registry = IngesterRegistry::new();
    Ok(registry)
}

fn build_hooks() -> HookRegistry {
    let mut hooks = HookRegistry::new();
    hooks.register(Arc::new(LoggingHook));
    hooks
}

async fn cmd_init(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    pool.close().await;
    println!("initialized database at {}", config.db.path.display());
    Ok(())
}

fn cmd_sources() -> Result<()> {
    let registry = build_registry()?;

    for source in list_sources(&registry) {
        println!("{}", source.source_type);
        println!("  entities: {}", source.entity_kinds.join(", "));
        if !source.instructions.is_empty() {
            println!("  {}", source.instructions);
        }
    }

    // The generic fallback is always available.
    let generic = GenericIngester;
    println!("{} (fallback)", generic.source_type());
    let kinds: Vec<String> = generic
        .supported_kinds()
        .iter()
        .map(|k| k.to_string())
        .collect();
    println!("  entities: {}", kinds.join(", "));
    println!("  {}", generic.instructions());
    Ok(())
}

fn cmd_discover(path: &PathBuf) -> Result<()> {
    let registry = build_registry()?;
    let result = discover(&registry, path)?;

    println!("discover {}", path.display());
    match &result.ingester {
        Some(ingester) => println!("  source type: {}", ingester.source_type()),
        None => println!("  source type: generic"),
    }
    for (kind, count) in &result.available_entities {
        println!("  {}: {}", kind, count);
    }
    if !result.has_content() {
        println!("  no ingestable content found");
    }
    println!("ok");
    Ok(())
}

fn parse_kinds(types: Option<String>) -> Result<Option<BTreeSet<EntityKind>>> {
    let Some(types) = types else { return Ok(None) };

    let mut kinds = BTreeSet::new();
    for code in types.split(',') {
        let code = code.trim();
        if code.is_empty() {
            continue;
        }
        let kind: EntityKind = code
            .parse()
            .with_context(|| format!("invalid entity kind: '{}'", code))?;
        kinds.insert(kind);
    }
    Ok(Some(kinds))
}

fn parse_filter(since: Option<String>, until: Option<String>) -> Result<Option<IngestionFilter>> {
    if since.is_none() && until.is_none() {
        return Ok(None);
    }

    let mut filter = IngestionFilter::default();
    if let Some(since) = since {
        filter.since =
            Some(parse_datetime(&since).with_context(|| format!("invalid --since: '{}'", since))?);
    }
    if let Some(until) = until {
        filter.until =
            Some(parse_datetime(&until).with_context(|| format!("invalid --until: '{}'", until))?);
    }
    Ok(Some(filter))
}

async fn cmd_ingest(
    config: &Config,
    path: &PathBuf,
    types: Option<String>,
    since: Option<String>,
    until: Option<String>,
) -> Result<()> {
    let store = Arc::new(open_store(config).await?);
    let registry = Arc::new(build_registry()?);
    let hooks = Arc::new(build_hooks());

    let kinds = parse_kinds(types)?;
    let filter = parse_filter(since, until)?;

    // Advisory only: re-importing the same file is allowed, dedup catches
    // the individual entities.
    if path.is_file() {
        let duplicate = check_duplicate(path, store.as_ref() as &dyn IngestionStore).await?;
        if let Some(message) = duplicate.message {
            eprintln!("warning: {}", message);
        }
    }

    let coordinator = IngestionCoordinator::new(
        Arc::clone(&store) as Arc<dyn IngestionStore>,
        registry,
        hooks,
    )
    .with_batch_size(config.ingestion.batch_size)
    .with_flush_interval(config.ingestion.flush_interval)
    .with_progress_callback(Arc::new(LoggingProgress::default()));

    let result = coordinator
        .run(path, kinds.as_ref(), filter.as_ref(), None)
        .await?;

    let run = &result.import_run;
    println!("ingest {}", path.display());
    println!("  status: {}", run.status);
    println!("  found: {}", run.entities_found);
    println!("  created: {}", result.stats.created);
    println!("  updated: {}", result.stats.updated);
    println!("  skipped: {}", result.stats.skipped);
    println!("  failed: {}", result.stats.failed);
    if let Some(error) = &run.error_message {
        println!("  error: {}", error);
    }
    println!("  run id: {}", run.id);

    if result.success() {
        println!("ok");
        Ok(())
    } else {
        bail!("import did not complete: {}", run.status)
    }
}

fn print_run(run: &ImportRun) {
    println!("{}", run.id);
    println!("  status: {}", run.status);
    println!("  started: {}", run.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(completed) = run.completed_at {
        println!("  completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    println!(
        "  found/created/updated/skipped/failed: {}/{}/{}/{}/{}",
        run.entities_found,
        run.entities_created,
        run.entities_updated,
        run.entities_skipped,
        run.entities_failed
    );
    if let Some(percent) = run.progress_percent() {
        println!(
            "  progress: {}/{} ({:.1}%)",
            run.progress_current,
            run.progress_total.unwrap_or(0),
            percent
        );
    }
    if let Some(file) = &run.current_file {
        println!("  current file: {}", file);
    }
    if let Some(error) = &run.error_message {
        println!("  error: {}", error);
    }
}

async fn cmd_runs(config: &Config, limit: i64) -> Result<()> {
    let store = open_store(config).await?;
    let runs = store.list_runs(limit).await?;

    if runs.is_empty() {
        println!("no import runs");
        return Ok(());
    }
    for run in runs {
        print_run(&run);
    }
    Ok(())
}

async fn cmd_show(config: &Config, run_id: &str) -> Result<()> {
    let store = open_store(config).await?;
    match store.get_run(run_id).await? {
        Some(run) => {
            print_run(&run);
            Ok(())
        }
        None => bail!("import run not found: {}", run_id),
    }
}

async fn cmd_cancel(config: &Config, run_id: &str) -> Result<()> {
    let store = open_store(config).await?;
    let result = cancel_import(&store, run_id).await;

    if result.success {
        println!("cancelled {}", run_id);
        Ok(())
    } else {
        bail!(
            "could not cancel {}: {}",
            run_id,
            result.error.unwrap_or_else(|| "unknown error".to_string())
        )
    }
}
