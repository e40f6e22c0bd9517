//! Document pipeline orchestration.
//!
//! Coordinates the per-category flow: list sources → idempotency check →
//! download → analyze → normalize → write artifact and manifest.
//!
//! Each file moves through `pending → analyzed → normalized → persisted`,
//! or ends `skipped` (already processed, empty) or `failed`. A failure is
//! recorded for that file only; the loop continues with the next one.
//! Directory setup or listing failures abort the category, never the run.
//!
//! The normalized artifact is the idempotency marker: a file whose
//! artifact exists is skipped unless `force` is set, and such files do not
//! count against the per-category cap. The manifest is written after the
//! artifact; if either write fails, both are removed again so a failed
//! file leaves nothing behind and is retried on the next run.
//!
//! # Layout
//!
//! | Input | Output |
//! |-------|--------|
//! | `{source_dir}/{rel}` | `{output_dir}/{rel}.json` |
//! | | `{processed_dir}/{rel}.manifest.json` |

use anyhow::{Context, Result};
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::analyzer::DocumentAnalyzer;
use crate::config::{join_path, CategoryConfig, CategoryPaths, Config};
use crate::models::{ManifestEntry, SourceFile};
use crate::normalize::{normalize, schema_by_name, FieldSchema, NormalizeContext};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::store::{upload_json, ObjectStore};

/// Per-invocation switches (CLI flags layered over `[pipeline]`).
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub force: bool,
    /// Overrides `pipeline.max_documents_per_category` when set.
    pub limit: Option<usize>,
    /// Restrict the run to these categories (configuration order is kept).
    pub only: Vec<String>,
    /// List and check idempotency only; no downloads, analysis, or writes.
    pub dry_run: bool,
}

/// How one file ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    Persisted {
        output_path: String,
        document_id: String,
        line_items: usize,
    },
    SkippedExisting,
    SkippedEmpty,
    /// Dry run: would be processed.
    Pending,
    Failed(String),
}

impl FileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FileOutcome::Persisted { .. } => "persisted",
            FileOutcome::SkippedExisting => "skipped (already processed)",
            FileOutcome::SkippedEmpty => "skipped (empty)",
            FileOutcome::Pending => "would process",
            FileOutcome::Failed(_) => "failed",
        }
    }

    /// Whether the file used up one slot of the per-category cap. Only
    /// files that reached (or would reach) analysis do.
    pub fn counts_against_cap(&self) -> bool {
        matches!(
            self,
            FileOutcome::Persisted { .. } | FileOutcome::Pending | FileOutcome::Failed(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileReport {
    pub source_path: String,
    pub outcome: FileOutcome,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CategoryReport {
    pub name: String,
    /// Files matching the category's globs.
    pub listed: usize,
    /// Files not looked at because the per-category cap was reached.
    pub capped: usize,
    pub files: Vec<FileReport>,
    /// Category-level failure (directory setup, listing, unknown schema).
    pub error: Option<String>,
}

impl CategoryReport {
    fn count(&self, pred: impl Fn(&FileOutcome) -> bool) -> usize {
        self.files.iter().filter(|f| pred(&f.outcome)).count()
    }

    pub fn persisted(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Persisted { .. }))
    }
    pub fn skipped_existing(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::SkippedExisting))
    }
    pub fn skipped_empty(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::SkippedEmpty))
    }
    pub fn pending(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Pending))
    }
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Failed(_)))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub categories: Vec<CategoryReport>,
    /// Requested category names with no configuration.
    pub unknown_categories: Vec<String>,
}

impl RunReport {
    pub fn persisted(&self) -> usize {
        self.categories.iter().map(CategoryReport::persisted).sum()
    }
    pub fn failed(&self) -> usize {
        self.categories.iter().map(CategoryReport::failed).sum()
    }

    pub fn print_summary(&self, dry_run: bool) {
        println!("run{}", if dry_run { " (dry-run)" } else { "" });
        for name in &self.unknown_categories {
            println!("  {}: skipped (not configured)", name);
        }
        for c in &self.categories {
            println!("  {}:", c.name);
            if let Some(ref err) = c.error {
                println!("    error: {}", err);
                continue;
            }
            println!("    listed: {}", c.listed);
            if dry_run {
                println!("    would process: {}", c.pending());
            } else {
                println!("    persisted: {}", c.persisted());
                println!("    failed: {}", c.failed());
            }
            println!("    skipped (already processed): {}", c.skipped_existing());
            println!("    skipped (empty): {}", c.skipped_empty());
            println!("    capped: {}", c.capped);
        }
        println!("ok");
    }
}

pub struct DocumentPipeline<'a> {
    store: &'a dyn ObjectStore,
    analyzer: &'a dyn DocumentAnalyzer,
    progress: &'a dyn ProgressReporter,
}

impl<'a> DocumentPipeline<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        analyzer: &'a dyn DocumentAnalyzer,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            store,
            analyzer,
            progress,
        }
    }

    /// Process every configured category, strictly one after another.
    pub async fn run(&self, config: &Config, options: &RunOptions) -> RunReport {
        let mut report = RunReport::default();

        for name in &options.only {
            if !config.categories.contains_key(name) {
                tracing::warn!(category = %name, "unrecognized category, skipping");
                report.unknown_categories.push(name.clone());
            }
        }

        let cap = options
            .limit
            .unwrap_or(config.pipeline.max_documents_per_category);
        let force = options.force || config.pipeline.force;

        for (name, category) in &config.categories {
            if !options.only.is_empty() && !options.only.contains(name) {
                continue;
            }
            let paths = category.paths(&config.storage.root, name);
            let category_report = self
                .run_category(name, category, &paths, cap, force, options.dry_run)
                .await;
            report.categories.push(category_report);
        }

        report
    }

    pub async fn run_category(
        &self,
        name: &str,
        category: &CategoryConfig,
        paths: &CategoryPaths,
        cap: usize,
        force: bool,
        dry_run: bool,
    ) -> CategoryReport {
        let report = self
            .category_report(name, category, paths, cap, force, dry_run)
            .await;
        self.progress.report(ProgressEvent::CategoryDone {
            category: report.name.clone(),
            persisted: report.persisted() as u64,
            skipped: (report.skipped_existing() + report.skipped_empty()) as u64,
            failed: report.failed() as u64,
            capped: report.capped as u64,
            error: report.error.clone(),
        });
        report
    }

    /// Walk the listing in order. Files whose artifact already exists are
    /// recorded as skipped and do not count against `cap`; once `cap` files
    /// have been analyzed (or would be, in a dry run) the rest are left for
    /// a later run.
    async fn category_report(
        &self,
        name: &str,
        category: &CategoryConfig,
        paths: &CategoryPaths,
        cap: usize,
        force: bool,
        dry_run: bool,
    ) -> CategoryReport {
        let mut report = CategoryReport {
            name: name.to_string(),
            ..Default::default()
        };

        let Some(schema) = schema_by_name(&category.schema) else {
            tracing::warn!(category = name, schema = %category.schema, "unknown field schema, skipping category");
            report.error = Some(format!("unknown schema '{}'", category.schema));
            return report;
        };

        let files = match self.prepare(name, category, paths, dry_run).await {
            Ok(files) => files,
            Err(e) => {
                tracing::error!(category = name, error = %format!("{:#}", e), "category aborted");
                report.error = Some(format!("{:#}", e));
                return report;
            }
        };

        report.listed = files.len();
        let listed = files.len() as u64;
        let mut dispatched = 0;
        for (i, file) in files.iter().enumerate() {
            if dispatched >= cap {
                report.capped = files.len() - i;
                tracing::info!(category = name, cap, capped = report.capped, "per-category cap reached");
                break;
            }

            let outcome = match self
                .process_file(file, &category.model_id, schema, paths, force, dry_run)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    let message = format!("{:#}", e);
                    tracing::error!(category = name, path = %file.path, error = %message, "document failed");
                    FileOutcome::Failed(message)
                }
            };
            if outcome.counts_against_cap() {
                dispatched += 1;
            }
            self.progress.report(ProgressEvent::Document {
                category: name.to_string(),
                n: i as u64 + 1,
                listed,
                path: file.path.clone(),
                outcome: outcome.label(),
            });
            report.files.push(FileReport {
                source_path: file.path.clone(),
                outcome,
            });
        }

        report
    }

    /// Ensure output directories exist and list matching source files.
    async fn prepare(
        &self,
        name: &str,
        category: &CategoryConfig,
        paths: &CategoryPaths,
        dry_run: bool,
    ) -> Result<Vec<SourceFile>> {
        if !dry_run {
            for dir in [&paths.output_dir, &paths.processed_dir] {
                self.store
                    .ensure_directory(dir)
                    .await
                    .with_context(|| format!("Failed to create directory '{}'", dir))?;
            }
        }

        let listed = self
            .store
            .list_files(&paths.source_dir)
            .await
            .with_context(|| format!("Failed to list '{}'", paths.source_dir))?;

        let include = build_globset(&category.include_globs)?;
        let exclude = build_globset(&category.exclude_globs)?;
        let prefix = format!("{}/", paths.source_dir.trim_matches('/'));

        let mut files = Vec::new();
        for path in listed {
            let relative = path
                .strip_prefix(&prefix)
                .unwrap_or(path.as_str())
                .to_string();
            if exclude.is_match(&relative) || !include.is_match(&relative) {
                continue;
            }
            files.push(SourceFile {
                content_type: detect_content_type(&path).to_string(),
                path,
                relative_path: relative,
                category: name.to_string(),
            });
        }
        tracing::info!(category = name, files = files.len(), "listed sources");
        self.progress.report(ProgressEvent::Listed {
            category: name.to_string(),
            files: files.len() as u64,
        });
        Ok(files)
    }

    async fn process_file(
        &self,
        file: &SourceFile,
        model_id: &str,
        schema: &FieldSchema,
        paths: &CategoryPaths,
        force: bool,
        dry_run: bool,
    ) -> Result<FileOutcome> {
        let output_path = artifact_path(&paths.output_dir, &file.relative_path);
        let manifest_path = manifest_path(&paths.processed_dir, &file.relative_path);

        if !force && self.store.exists(&output_path).await? {
            tracing::debug!(path = %file.path, "already processed");
            return Ok(FileOutcome::SkippedExisting);
        }
        if dry_run {
            return Ok(FileOutcome::Pending);
        }

        let content = self
            .store
            .download(&file.path)
            .await
            .context("download failed")?;
        if content.is_empty() {
            tracing::warn!(path = %file.path, "empty file, skipping");
            return Ok(FileOutcome::SkippedEmpty);
        }

        let result = self
            .analyzer
            .analyze(model_id, &content, &file.content_type)
            .await
            .context("analysis failed")?;
        tracing::debug!(path = %file.path, "analyzed");
        let analyzed = result.document_count();
        if analyzed > 1 {
            tracing::warn!(
                path = %file.path,
                documents = analyzed,
                "analysis returned several documents, only the first is normalized"
            );
        }

        let processed_at = Utc::now();
        let context = NormalizeContext {
            source_path: file.path.clone(),
            category: file.category.clone(),
            normalized_at: processed_at,
            fallback_document_id: Uuid::new_v4().to_string(),
        };
        let document = normalize(&result, schema, &context).context("normalization failed")?;
        tracing::debug!(path = %file.path, document_id = document.document_id(), "normalized");

        if let Err(e) = upload_json(self.store, &output_path, &document).await {
            let e = e.context("writing normalized artifact failed");
            return Err(self.discard(&[output_path.as_str()], e).await);
        }

        let entry = ManifestEntry {
            source_path: file.path.clone(),
            output_path: output_path.clone(),
            processed_at,
            model_id: document
                .header_str("model_id")
                .unwrap_or(model_id)
                .to_string(),
            api_version: document
                .header_str("api_version")
                .unwrap_or(result.api_version.as_str())
                .to_string(),
            document_id: document.document_id().to_string(),
            line_item_count: document.line_items.len(),
            source_bytes: content.len(),
            source_sha256: hex::encode(Sha256::digest(&content)),
        };
        if let Err(e) = upload_json(self.store, &manifest_path, &entry).await {
            let e = e.context("writing manifest entry failed");
            return Err(self
                .discard(&[output_path.as_str(), manifest_path.as_str()], e)
                .await);
        }

        tracing::info!(
            path = %file.path,
            output = %output_path,
            line_items = entry.line_item_count,
            "persisted"
        );
        Ok(FileOutcome::Persisted {
            output_path,
            document_id: entry.document_id,
            line_items: entry.line_item_count,
        })
    }

    /// Remove what a failed write left behind so the file is retried on
    /// the next run. The artifact goes first since it marks completion.
    async fn discard(&self, paths: &[&str], error: anyhow::Error) -> anyhow::Error {
        for path in paths {
            if let Err(cleanup) = self.store.delete(path).await {
                tracing::error!(path = %path, error = %format!("{:#}", cleanup), "could not remove partial write");
                return error.context(format!("partial write at '{}' could not be removed", path));
            }
        }
        error
    }
}

pub fn artifact_path(output_dir: &str, relative_path: &str) -> String {
    format!("{}.json", join_path(output_dir, relative_path))
}

pub fn manifest_path(processed_dir: &str, relative_path: &str) -> String {
    format!("{}.manifest.json", join_path(processed_dir, relative_path))
}

/// MIME type sent to the analysis service, from the file extension.
pub fn detect_content_type(path: &str) -> &'static str {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let ext = match file_name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return "application/octet-stream",
    };
    match ext.as_str() {
        "pdf" => "application/pdf",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "heif" => "image/heif",
        "html" | "htm" => "text/html",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        _ => "application/octet-stream",
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}
