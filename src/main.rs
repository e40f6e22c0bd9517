//! # Lakeflow CLI (`lakeflow`)
//!
//! Runs the document stage (analyze and normalize new files in the lake)
//! and the table stage (load normalized records into managed tables).
//!
//! ## Usage
//!
//! ```bash
//! lakeflow --config ./config/lakeflow.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lakeflow run` | Process unprocessed documents of every category |
//! | `lakeflow load` | Load normalized records into tables on a compute session |
//! | `lakeflow all` | `run`, then `load` |
//! | `lakeflow categories` | Show configured categories and resolved settings |
//!
//! ## Examples
//!
//! ```bash
//! # Only invoices, at most 10 files, show what would happen
//! lakeflow run --category invoices --limit 10 --dry-run
//!
//! # Reprocess everything that already has an artifact
//! lakeflow run --force
//!
//! # Preview table row counts without starting a session
//! lakeflow load --dry-run
//! ```

use clap::{Args, Parser, Subcommand};
use lakeflow::auth::{EnvTokenProvider, TokenProvider};
use lakeflow::config::{self, SettingOverrides, Settings, SENTINEL_DIR};
use lakeflow::pipeline::RunOptions;
use lakeflow::progress::ProgressMode;
use lakeflow::stages;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{filter::LevelFilter, fmt};

/// Lakeflow: document ingestion for a data lake.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/lakeflow.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "lakeflow",
    about = "Lakeflow: analyze lake documents and load them into managed tables",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lakeflow.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Progress output on stderr. Defaults to `human` on a TTY, else `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(flatten)]
    settings: SettingArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Environment-specific identifiers; each overrides config, env, and
/// sentinel-file values.
#[derive(Args)]
struct SettingArgs {
    #[arg(long, global = true)]
    workspace_id: Option<String>,
    #[arg(long, global = true)]
    item_id: Option<String>,
    #[arg(long, global = true)]
    analysis_endpoint: Option<String>,
    #[arg(long, global = true)]
    compute_endpoint: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze and normalize unprocessed documents.
    ///
    /// Files whose normalized artifact already exists are skipped unless
    /// `--force` is given. One failing document never stops the batch.
    Run(RunArgs),

    /// Load normalized records into the managed tables.
    ///
    /// Creates a compute session, runs the load statement, and always
    /// stops the session afterwards.
    Load {
        /// Read artifacts and count rows locally; no session is created.
        #[arg(long)]
        dry_run: bool,
    },

    /// Run the document stage, then the table stage.
    All {
        /// Reprocess documents that already have an artifact.
        #[arg(long)]
        force: bool,
    },

    /// List configured categories and where each setting came from.
    Categories,
}

#[derive(Args)]
struct RunArgs {
    /// Only these categories (repeatable).
    #[arg(long = "category")]
    categories: Vec<String>,

    /// Reprocess documents that already have an artifact.
    #[arg(long)]
    force: bool,

    /// Maximum number of documents per category.
    #[arg(long)]
    limit: Option<usize>,

    /// List and check idempotency only; nothing is analyzed or written.
    #[arg(long)]
    dry_run: bool,
}

fn determine_log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(determine_log_level(cli.verbose));

    let cfg = config::load_config(&cli.config)?;
    let overrides = SettingOverrides {
        workspace_id: cli.settings.workspace_id,
        item_id: cli.settings.item_id,
        analysis_endpoint: cli.settings.analysis_endpoint,
        compute_endpoint: cli.settings.compute_endpoint,
    };
    let sentinel_dir = PathBuf::from(SENTINEL_DIR);
    let settings = Settings::resolve(&cfg, &overrides, &sentinel_dir);
    let tokens: Arc<dyn TokenProvider> = Arc::new(EnvTokenProvider);
    let progress = cli
        .progress
        .unwrap_or_else(ProgressMode::default_for_tty)
        .reporter();

    match cli.command {
        Commands::Run(args) => {
            let options = RunOptions {
                force: args.force,
                limit: args.limit,
                only: args.categories,
                dry_run: args.dry_run,
            };
            stages::run_documents(&cfg, &settings, tokens, &options, progress.as_ref()).await?;
        }
        Commands::Load { dry_run } => {
            stages::run_load(&cfg, &settings, tokens, dry_run).await?;
        }
        Commands::All { force } => {
            let options = RunOptions {
                force,
                ..Default::default()
            };
            // The table stage still runs after document failures; the
            // document error is reported once both stages are done.
            let documents = stages::run_documents(
                &cfg,
                &settings,
                tokens.clone(),
                &options,
                progress.as_ref(),
            )
            .await;
            if let Err(ref e) = documents {
                tracing::error!(error = %format!("{:#}", e), "document stage failed");
            }
            stages::run_load(&cfg, &settings, tokens, false).await?;
            documents?;
        }
        Commands::Categories => {
            stages::list_categories(&cfg, &settings);
        }
    }

    Ok(())
}
