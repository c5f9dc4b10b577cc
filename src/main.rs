#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod config;
mod error;
mod models;
mod reconcile;
mod source;
mod storage;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::RowreconConfig;
use models::RunStatus;
use reconcile::{Reconciler, RunSummary};
use source::{RowSource, SqliteRowSource};
use storage::RepositoryStore;

#[derive(Parser)]
#[command(name = "rowrecon")]
#[command(about = "Row-level data reconciliation between two databases", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to rowrecon.toml
    #[arg(long, global = true, default_value = "rowrecon.toml")]
    config: PathBuf,

    /// Log level filter (e.g. debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or migrate the repository database
    Init,

    /// Reconcile every enabled table
    Reconcile {
        /// Only reconcile the table with this alias
        #[arg(long)]
        table: Option<String>,
    },

    /// Re-check recorded out-of-sync rows against both sides
    Check {
        /// Only check the table with this alias
        #[arg(long)]
        table: Option<String>,
        /// Generate fix statements for the target
        #[arg(long)]
        fix: bool,
    },

    /// Manage configuration (rowrecon.toml)
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default rowrecon.toml
    Init,
    /// Show path to the config file
    Path,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { action } => handle_config(&cli.config, action),
        command => {
            init_logging(&cli.log_level);
            let rt = cli_runtime()?;
            rt.block_on(run(command, &cli.config))
        }
    }
}

/// Structured JSON logging by default, text via ROWRECON_LOG_TEXT=1.
fn init_logging(level: &str) {
    let text_logging = std::env::var("ROWRECON_LOG_TEXT")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rowrecon={}", level).into());

    if text_logging {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    }
}

fn cli_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    let num_cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    Ok(tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus.max(4))
        .thread_name("rowrecon-worker")
        .enable_all()
        .build()?)
}

async fn open_repository(config: &RowreconConfig) -> anyhow::Result<RepositoryStore> {
    let store = RepositoryStore::new(&config.repository.path).await?;
    store.migrate().await?;
    store.health_check().await?;
    Ok(store)
}

async fn build_reconciler(config: &RowreconConfig) -> anyhow::Result<Reconciler> {
    let store = open_repository(config).await?;
    let source = SqliteRowSource::connect(&config.source.url).await?;
    let target = SqliteRowSource::connect(&config.target.url).await?;
    let fix_quote = config.target.quote_char.unwrap_or(target.quote_char());

    Ok(Reconciler::new(
        store,
        Arc::new(source),
        Arc::new(target),
        config.compare.clone(),
    )
    .with_fix_quote(fix_quote))
}

async fn run(command: Commands, config_path: &Path) -> anyhow::Result<()> {
    let config = config::load_config(config_path)?;

    match command {
        Commands::Init => {
            open_repository(&config).await?;
            println!("Repository ready: {}", config.repository.path);
            Ok(())
        }
        Commands::Reconcile { table } => {
            check_table_filter(&config, table.as_deref())?;
            let reconciler = build_reconciler(&config).await?;
            let summary = reconciler
                .reconcile_all(&config.tables, table.as_deref())
                .await;
            report(&summary)
        }
        Commands::Check { table, fix } => {
            check_table_filter(&config, table.as_deref())?;
            let reconciler = build_reconciler(&config).await?;
            let summary = reconciler
                .check_all(&config.tables, table.as_deref(), fix)
                .await;
            report(&summary)
        }
        Commands::Config { .. } => Ok(()),
    }
}

fn check_table_filter(config: &RowreconConfig, table: Option<&str>) -> anyhow::Result<()> {
    if let Some(alias) = table {
        if config.table(alias).is_none() {
            anyhow::bail!("No table with alias '{}' in configuration", alias);
        }
    }
    Ok(())
}

/// Print the JSON summary; failed tables turn into a non-zero exit.
fn report(summary: &RunSummary) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);

    let failed: Vec<&str> = summary
        .results
        .iter()
        .filter(|r| r.status == RunStatus::Failed)
        .map(|r| r.table_name.as_str())
        .collect();
    tracing::info!(
        rid = %summary.rid,
        "Run finished in {}s: {}",
        summary.elapsed_time,
        json!({ "tables": summary.results.len(), "failed": failed.len() })
    );

    if !failed.is_empty() {
        anyhow::bail!("{} table(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

fn handle_config(config_path: &Path, action: Option<ConfigAction>) -> anyhow::Result<()> {
    match action {
        Some(ConfigAction::Path) => {
            println!("{}", config_path.display());
        }
        Some(ConfigAction::Init) => {
            if config_path.exists() {
                eprintln!("Config already exists: {}", config_path.display());
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(config_path, config::DEFAULT_CONFIG)?;
            println!("Created: {}", config_path.display());
        }
        None => {
            // Show effective config
            let config = config::load_config_or_default(config_path);
            println!("# Effective config ({})\n", config_path.display());
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
