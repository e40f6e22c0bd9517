//! Command entry points for the two pipeline stages.
//!
//! Each stage first checks that its environment-specific settings resolved.
//! A stage with missing settings is skipped with a message and counts as
//! success; the stages are optional pieces of infrastructure.
//!
//! | Stage | Needs |
//! |-------|-------|
//! | documents (`run`) | `workspace_id`, `item_id`, `analysis_endpoint` |
//! | tables (`load`) | `workspace_id`, `item_id`, `compute_endpoint` |

use anyhow::{bail, Context, Result};
use std::sync::Arc;

use crate::analyzer::AnalysisClient;
use crate::auth::TokenProvider;
use crate::config::{Config, Settings, SourceKind};
use crate::models::NormalizedDocument;
use crate::pipeline::{DocumentPipeline, RunOptions, RunReport};
use crate::progress::ProgressReporter;
use crate::session::{ComputeSessionManager, SessionError};
use crate::store::{download_json, DfsStore, ObjectStore};
use crate::table_load::{parse_summary, project_rows, LoadSummary, TableLoadJob};

/// How a stage ended when it did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    Skipped(String),
}

fn skipped(stage: &str, missing: &[&str]) -> StageOutcome {
    let reason = format!("missing {}", missing.join(", "));
    tracing::info!(stage, reason = %reason, "stage skipped");
    println!("{}: skipped ({})", stage, reason);
    StageOutcome::Skipped(reason)
}

fn open_store(
    config: &Config,
    settings: &Settings,
    tokens: Arc<dyn TokenProvider>,
) -> Result<Option<DfsStore>> {
    match (settings.workspace(), settings.item()) {
        (Some(workspace), Some(item)) => Ok(Some(DfsStore::new(
            &config.storage,
            workspace,
            item,
            tokens,
        )?)),
        _ => Ok(None),
    }
}

/// `lakeflow run`: analyze and normalize new documents.
///
/// Fails (after printing the report) when any document failed, so callers
/// can alert; the failed documents are retried by the next run.
pub async fn run_documents(
    config: &Config,
    settings: &Settings,
    tokens: Arc<dyn TokenProvider>,
    options: &RunOptions,
    progress: &dyn ProgressReporter,
) -> Result<StageOutcome> {
    let missing = settings.missing_for_pipeline();
    if !missing.is_empty() {
        return Ok(skipped("documents", &missing));
    }
    let (Some(store), Some(endpoint)) = (
        open_store(config, settings, tokens.clone())?,
        settings.analysis(),
    ) else {
        return Ok(skipped("documents", &missing));
    };
    let analyzer = AnalysisClient::new(&config.analysis, endpoint, tokens)?;

    let pipeline = DocumentPipeline::new(&store, &analyzer, progress);
    let report = pipeline.run(config, options).await;
    report.print_summary(options.dry_run);
    check_report(&report)?;
    Ok(StageOutcome::Completed)
}

fn check_report(report: &RunReport) -> Result<()> {
    let failed = report.failed();
    let aborted = report
        .categories
        .iter()
        .filter(|c| c.error.is_some())
        .count();
    if failed > 0 || aborted > 0 {
        bail!(
            "{} document(s) failed, {} categor{} aborted",
            failed,
            aborted,
            if aborted == 1 { "y" } else { "ies" }
        );
    }
    Ok(())
}

/// `lakeflow load`: run the table load job on a fresh compute session.
///
/// With `dry_run`, reads the normalized artifacts and projects the rows
/// locally instead; no session is created.
pub async fn run_load(
    config: &Config,
    settings: &Settings,
    tokens: Arc<dyn TokenProvider>,
    dry_run: bool,
) -> Result<StageOutcome> {
    if dry_run {
        return preview_load(config, settings, tokens).await;
    }

    let missing = settings.missing_for_load();
    if !missing.is_empty() {
        return Ok(skipped("load", &missing));
    }
    let Some(endpoint) = settings.compute() else {
        return Ok(skipped("load", &["compute_endpoint"]));
    };

    let manager = ComputeSessionManager::new(&config.compute, endpoint, tokens)?;
    let job = TableLoadJob::from_config(config);
    tracing::info!(sources = job.sources.len(), "submitting table load");

    let output = match manager.run_statement(&job.code()).await {
        Ok(output) => output,
        Err(SessionError::Unavailable(message)) => {
            tracing::warn!(reason = %message, "compute sessions unavailable");
            println!("load: skipped ({})", message);
            return Ok(StageOutcome::Skipped(message));
        }
        Err(e) => return Err(e).context("Table load failed"),
    };

    let summary = parse_summary(output.text.as_deref().unwrap_or_default())?;
    summary.print(&job.header_table, &job.line_item_table);
    Ok(StageOutcome::Completed)
}

async fn preview_load(
    config: &Config,
    settings: &Settings,
    tokens: Arc<dyn TokenProvider>,
) -> Result<StageOutcome> {
    let Some(store) = open_store(config, settings, tokens)? else {
        let mut missing = Vec::new();
        if settings.workspace().is_none() {
            missing.push("workspace_id");
        }
        if settings.item().is_none() {
            missing.push("item_id");
        }
        return Ok(skipped("load", &missing));
    };
    let job = TableLoadJob::from_config(config);
    let documents = read_artifacts(&store, &job.sources).await?;
    let summary: LoadSummary = project_rows(&documents).summary(documents.len());
    println!("(dry-run)");
    summary.print(&job.header_table, &job.line_item_table);
    Ok(StageOutcome::Completed)
}

/// Read every normalized artifact under `sources`, in listing order.
pub async fn read_artifacts(
    store: &dyn ObjectStore,
    sources: &[String],
) -> Result<Vec<NormalizedDocument>> {
    let mut documents = Vec::new();
    for dir in sources {
        for path in store.list_files(dir).await? {
            if !path.ends_with(".json") {
                continue;
            }
            match download_json::<NormalizedDocument>(store, &path).await {
                Ok(doc) => documents.push(doc),
                Err(e) => {
                    tracing::warn!(path = %path, error = %format!("{:#}", e), "unreadable artifact")
                }
            }
        }
    }
    Ok(documents)
}

/// `lakeflow categories`: configured categories and resolved settings.
pub fn list_categories(config: &Config, settings: &Settings) {
    println!(
        "{:<16} {:<24} {:<10} SOURCE",
        "CATEGORY", "MODEL", "SCHEMA"
    );
    for (name, category) in &config.categories {
        let paths = category.paths(&config.storage.root, name);
        println!(
            "{:<16} {:<24} {:<10} {}",
            name, category.model_id, category.schema, paths.source_dir
        );
    }
    if config.categories.is_empty() {
        println!("(no categories configured)");
    }

    println!();
    println!("{:<20} {:<12} VALUE", "SETTING", "FROM");
    for (name, resolved) in [
        ("workspace_id", &settings.workspace_id),
        ("item_id", &settings.item_id),
        ("analysis_endpoint", &settings.analysis_endpoint),
        ("compute_endpoint", &settings.compute_endpoint),
    ] {
        match resolved {
            Some(r) => println!("{:<20} {:<12} {}", name, source_label(r.source), r.value),
            None => println!("{:<20} {:<12} -", name, "unset"),
        }
    }
}

fn source_label(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::Parameter => "flag",
        SourceKind::ConfigFile => "config",
        SourceKind::Environment => "env",
        SourceKind::SentinelFile => "file",
    }
}
