//! TOML configuration and setting resolution.
//!
//! The configuration file describes where documents live, which analysis
//! model handles each category, and how the table-load session is sized.
//! Identifiers that usually differ per environment (workspace, item,
//! endpoints) are optional in the file and go through
//! [`resolve_setting`], which walks [`RESOLUTION_ORDER`].
//!
//! # Example
//!
//! ```toml
//! [storage]
//! workspace_id = "9c1f..."
//! item_id = "lakehouse-01"
//!
//! [analysis]
//! endpoint = "https://docs.example.cognitiveservices.azure.com"
//!
//! [categories.invoices]
//! model_id = "prebuilt-invoice"
//! schema = "invoice"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub categories: BTreeMap<String, CategoryConfig>,
    #[serde(default)]
    pub compute: ComputeConfig,
    #[serde(default)]
    pub tables: TablesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    /// Container inside the workspace (the lakehouse item).
    #[serde(default)]
    pub item_id: Option<String>,
    /// Prefix under the item that every category directory lives in.
    #[serde(default = "default_storage_root")]
    pub root: String,
    #[serde(default = "default_dfs_api_version")]
    pub api_version: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: default_storage_endpoint(),
            workspace_id: None,
            item_id: None,
            root: default_storage_root(),
            api_version: default_dfs_api_version(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_storage_endpoint() -> String {
    "https://onelake.dfs.fabric.microsoft.com".to_string()
}
fn default_storage_root() -> String {
    "Files".to_string()
}
fn default_dfs_api_version() -> String {
    "2023-11-03".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_models_path")]
    pub models_path: String,
    #[serde(default = "default_analysis_api_version")]
    pub api_version: String,
    #[serde(default = "default_analysis_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_analysis_max_attempts")]
    pub max_poll_attempts: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            models_path: default_models_path(),
            api_version: default_analysis_api_version(),
            poll_interval_secs: default_analysis_poll_interval(),
            max_poll_attempts: default_analysis_max_attempts(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_models_path() -> String {
    "models".to_string()
}
fn default_analysis_api_version() -> String {
    "2023-07-31".to_string()
}
fn default_analysis_poll_interval() -> u64 {
    3
}
fn default_analysis_max_attempts() -> u32 {
    40
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Reprocess files whose normalized artifact already exists.
    #[serde(default)]
    pub force: bool,
    #[serde(default = "default_max_documents")]
    pub max_documents_per_category: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            force: false,
            max_documents_per_category: default_max_documents(),
        }
    }
}

fn default_max_documents() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct CategoryConfig {
    pub model_id: String,
    /// Field schema used to normalize results (`invoice`, `receipt`).
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default)]
    pub source_dir: Option<String>,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub processed_dir: Option<String>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_schema() -> String {
    "invoice".to_string()
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

/// Directory layout of one category, relative to the item root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryPaths {
    pub source_dir: String,
    pub output_dir: String,
    pub processed_dir: String,
}

impl CategoryConfig {
    pub fn paths(&self, root: &str, name: &str) -> CategoryPaths {
        let join = |dir: &Option<String>, default: String| {
            let rel = dir.clone().unwrap_or(default);
            join_path(root, &rel)
        };
        CategoryPaths {
            source_dir: join(&self.source_dir, format!("raw/{}", name)),
            output_dir: join(&self.output_dir, format!("normalized/{}", name)),
            processed_dir: join(&self.processed_dir, format!("processed/{}", name)),
        }
    }
}

/// Join store path segments with a single `/`, dropping empty parts.
pub fn join_path(base: &str, rel: &str) -> String {
    let base = base.trim_matches('/');
    let rel = rel.trim_matches('/');
    match (base.is_empty(), rel.is_empty()) {
        (true, _) => rel.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{}/{}", base, rel),
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ComputeConfig {
    /// Session API root, e.g. `.../workspaces/{ws}/lakehouses/{lh}/livyapi/versions/2023-12-01`.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_session_name")]
    pub session_name: String,
    #[serde(default = "default_memory")]
    pub driver_memory: String,
    #[serde(default = "default_cores")]
    pub driver_cores: u32,
    #[serde(default = "default_memory")]
    pub executor_memory: String,
    #[serde(default = "default_cores")]
    pub executor_cores: u32,
    #[serde(default = "default_num_executors")]
    pub num_executors: u32,
    #[serde(default = "default_session_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            session_name: default_session_name(),
            driver_memory: default_memory(),
            driver_cores: default_cores(),
            executor_memory: default_memory(),
            executor_cores: default_cores(),
            num_executors: default_num_executors(),
            poll_interval_secs: default_session_poll_interval(),
            session_timeout_secs: default_session_timeout(),
            statement_timeout_secs: default_statement_timeout(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_session_name() -> String {
    "lakeflow-table-load".to_string()
}
fn default_memory() -> String {
    "28g".to_string()
}
fn default_cores() -> u32 {
    4
}
fn default_num_executors() -> u32 {
    1
}
fn default_session_poll_interval() -> u64 {
    5
}
fn default_session_timeout() -> u64 {
    300
}
fn default_statement_timeout() -> u64 {
    1200
}

#[derive(Debug, Deserialize, Clone)]
pub struct TablesConfig {
    #[serde(default = "default_header_table")]
    pub header_table: String,
    #[serde(default = "default_line_item_table")]
    pub line_item_table: String,
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            header_table: default_header_table(),
            line_item_table: default_line_item_table(),
        }
    }
}

fn default_header_table() -> String {
    "document_headers".to_string()
}
fn default_line_item_table() -> String {
    "document_line_items".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.pipeline.max_documents_per_category == 0 {
        bail!("pipeline.max_documents_per_category must be > 0");
    }
    if config.analysis.max_poll_attempts == 0 {
        bail!("analysis.max_poll_attempts must be > 0");
    }
    if config.compute.poll_interval_secs == 0 {
        bail!("compute.poll_interval_secs must be > 0");
    }
    for (name, category) in &config.categories {
        if category.model_id.trim().is_empty() {
            bail!("categories.{}.model_id must not be empty", name);
        }
        for (key, patterns) in [
            ("include_globs", &category.include_globs),
            ("exclude_globs", &category.exclude_globs),
        ] {
            for pattern in patterns {
                globset::Glob::new(pattern).with_context(|| {
                    format!("categories.{}.{}: invalid glob '{}'", name, key, pattern)
                })?;
            }
        }
    }

    Ok(config)
}

// ============ Setting resolution ============

/// Kind of place a setting can come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Command-line flag.
    Parameter,
    /// Value in the TOML file.
    ConfigFile,
    /// Process environment variable.
    Environment,
    /// One-line file under the sentinel directory.
    SentinelFile,
}

/// Precedence used by [`Settings`]: first present value wins.
pub const RESOLUTION_ORDER: [SourceKind; 4] = [
    SourceKind::Parameter,
    SourceKind::ConfigFile,
    SourceKind::Environment,
    SourceKind::SentinelFile,
];

/// A named candidate source for one setting.
#[derive(Debug, Clone)]
pub enum SettingSource {
    Value { kind: SourceKind, value: Option<String> },
    Env(String),
    File(PathBuf),
}

impl SettingSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            SettingSource::Value { kind, .. } => *kind,
            SettingSource::Env(_) => SourceKind::Environment,
            SettingSource::File(_) => SourceKind::SentinelFile,
        }
    }

    fn read(&self) -> Option<String> {
        let raw = match self {
            SettingSource::Value { value, .. } => value.clone(),
            SettingSource::Env(var) => std::env::var(var).ok(),
            SettingSource::File(path) => std::fs::read_to_string(path).ok(),
        }?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// A resolved setting and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub name: String,
    pub value: String,
    pub source: SourceKind,
}

/// Return the first non-blank value among `sources`, in the given order.
pub fn resolve_setting(name: &str, sources: &[SettingSource]) -> Option<Resolved> {
    sources.iter().find_map(|source| {
        source.read().map(|value| Resolved {
            name: name.to_string(),
            value,
            source: source.kind(),
        })
    })
}

/// Resolves the environment-specific identifiers for one invocation.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub workspace_id: Option<Resolved>,
    pub item_id: Option<Resolved>,
    pub analysis_endpoint: Option<Resolved>,
    pub compute_endpoint: Option<Resolved>,
}

/// CLI overrides for [`Settings::resolve`].
#[derive(Debug, Clone, Default)]
pub struct SettingOverrides {
    pub workspace_id: Option<String>,
    pub item_id: Option<String>,
    pub analysis_endpoint: Option<String>,
    pub compute_endpoint: Option<String>,
}

pub const SENTINEL_DIR: &str = ".lakeflow";

impl Settings {
    pub fn resolve(config: &Config, overrides: &SettingOverrides, sentinel_dir: &Path) -> Self {
        let lookup = |name: &str, param: &Option<String>, file_value: &Option<String>| {
            let sources: Vec<SettingSource> = RESOLUTION_ORDER
                .iter()
                .map(|kind| match kind {
                    SourceKind::Parameter => SettingSource::Value {
                        kind: SourceKind::Parameter,
                        value: param.clone(),
                    },
                    SourceKind::ConfigFile => SettingSource::Value {
                        kind: SourceKind::ConfigFile,
                        value: file_value.clone(),
                    },
                    SourceKind::Environment => {
                        SettingSource::Env(format!("LAKEFLOW_{}", name.to_uppercase()))
                    }
                    SourceKind::SentinelFile => SettingSource::File(sentinel_dir.join(name)),
                })
                .collect();
            resolve_setting(name, &sources)
        };

        Self {
            workspace_id: lookup(
                "workspace_id",
                &overrides.workspace_id,
                &config.storage.workspace_id,
            ),
            item_id: lookup("item_id", &overrides.item_id, &config.storage.item_id),
            analysis_endpoint: lookup(
                "analysis_endpoint",
                &overrides.analysis_endpoint,
                &config.analysis.endpoint,
            ),
            compute_endpoint: lookup(
                "compute_endpoint",
                &overrides.compute_endpoint,
                &config.compute.endpoint,
            ),
        }
    }

    /// Names of the settings the document stage needs but could not find.
    pub fn missing_for_pipeline(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.workspace_id.is_none() {
            missing.push("workspace_id");
        }
        if self.item_id.is_none() {
            missing.push("item_id");
        }
        if self.analysis_endpoint.is_none() {
            missing.push("analysis_endpoint");
        }
        missing
    }

    pub fn missing_for_load(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.workspace_id.is_none() {
            missing.push("workspace_id");
        }
        if self.item_id.is_none() {
            missing.push("item_id");
        }
        if self.compute_endpoint.is_none() {
            missing.push("compute_endpoint");
        }
        missing
    }
}

fn value_of(resolved: &Option<Resolved>) -> Option<&str> {
    resolved.as_ref().map(|r| r.value.as_str())
}

impl Settings {
    pub fn workspace(&self) -> Option<&str> {
        value_of(&self.workspace_id)
    }
    pub fn item(&self) -> Option<&str> {
        value_of(&self.item_id)
    }
    pub fn analysis(&self) -> Option<&str> {
        value_of(&self.analysis_endpoint)
    }
    pub fn compute(&self) -> Option<&str> {
        value_of(&self.compute_endpoint)
    }
}
