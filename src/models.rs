//! Core data models used throughout lakeflow.
//!
//! These types represent the files, analysis results, normalized documents,
//! and manifest entries that flow through the document pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the [`NormalizedDocument`] layout written to the lake.
pub const NORMALIZED_SCHEMA_VERSION: u32 = 1;

/// A file discovered by listing a category's source directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Store-relative path.
    pub path: String,
    /// Path relative to the category's source directory.
    pub relative_path: String,
    pub category: String,
    pub content_type: String,
}

/// Terminal response of the analysis service for one file.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub model_id: String,
    pub api_version: String,
    /// Full poll response body (`{status, analyzeResult, ...}`).
    pub raw: serde_json::Value,
}

impl AnalysisResult {
    /// Number of documents the service recognized in the file.
    pub fn document_count(&self) -> usize {
        self.raw["analyzeResult"]["documents"]
            .as_array()
            .map_or(0, Vec::len)
    }
}

/// One itemized row of a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    /// 1-based, in source order.
    pub line_number: u32,
    pub description: Option<String>,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    pub unit_price: Option<f64>,
    pub amount: Option<f64>,
    pub product_code: Option<String>,
    pub tax: Option<f64>,
    pub date: Option<String>,
}

/// Stable representation of one analyzed document.
///
/// `header` always holds a `document_id`; `line_items` is present (possibly
/// empty) even when the source has no itemized rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedDocument {
    pub schema_version: u32,
    pub header: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

impl NormalizedDocument {
    pub fn document_id(&self) -> &str {
        self.header
            .get("document_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }

    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.header.get(key).and_then(|v| v.as_str())
    }
}

/// Observability record written next to each normalized artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub source_path: String,
    pub output_path: String,
    pub processed_at: DateTime<Utc>,
    pub model_id: String,
    pub api_version: String,
    pub document_id: String,
    pub line_item_count: usize,
    pub source_bytes: usize,
    pub source_sha256: String,
}
