//! Managed-table load job.
//!
//! A fixed PySpark unit submitted through [`crate::session`] that reads
//! every normalized artifact of every category and overwrites two tables:
//!
//! | Table | Row per | Natural key |
//! |-------|---------|-------------|
//! | headers | document | `document_id`, `source_path` |
//! | line items | line item | `document_id`, `line_number`, `description` |
//!
//! Two guarantees hold for any body swapped in here: the write is an
//! overwrite (re-running is idempotent) and rows are deduplicated on the
//! natural keys. An absent or empty input set is a no-op, not an error.
//!
//! [`project_rows`] performs the same projection locally so
//! `lakeflow load --dry-run` can preview row counts without a session.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use crate::config::Config;
use crate::models::NormalizedDocument;
use crate::normalize::{FieldSchema, Rule, INVOICE_SCHEMA, RECEIPT_SCHEMA};

/// Prefix of the summary line the statement prints.
pub const SUMMARY_MARKER: &str = "LAKEFLOW_SUMMARY ";

pub const HEADER_KEY: [&str; 2] = ["document_id", "source_path"];
pub const LINE_ITEM_KEY: [&str; 3] = ["document_id", "line_number", "description"];

/// Header columns every schema shares, ahead of the schema fields.
const HEADER_META: &[(&str, &str)] = &[
    ("document_id", "string"),
    ("document_id_generated", "boolean"),
    ("schema", "string"),
    ("category", "string"),
    ("source_path", "string"),
    ("doc_type", "string"),
    ("confidence", "double"),
    ("currency_code", "string"),
    ("model_id", "string"),
    ("api_version", "string"),
    ("normalized_at", "string"),
];

const LINE_ITEM_COLUMNS: &[(&str, &str)] = &[
    ("document_id", "string"),
    ("source_path", "string"),
    ("category", "string"),
    ("line_number", "int"),
    ("description", "string"),
    ("quantity", "double"),
    ("unit", "string"),
    ("unit_price", "double"),
    ("amount", "double"),
    ("product_code", "string"),
    ("tax", "double"),
    ("date", "string"),
];

/// Fixed header table schema: shared columns, then the union of all
/// built-in schema fields in declaration order.
pub fn header_columns() -> Vec<(&'static str, &'static str)> {
    let schemas: [&FieldSchema; 2] = [&INVOICE_SCHEMA, &RECEIPT_SCHEMA];
    let mut columns: Vec<(&str, &str)> = HEADER_META.to_vec();
    for schema in schemas {
        for rule in schema.header {
            if columns.iter().any(|(name, _)| *name == rule.key) {
                continue;
            }
            let spark_type = match rule.rule {
                Rule::Amount | Rule::Number => "double",
                Rule::Text | Rule::Date | Rule::Address => "string",
            };
            columns.push((rule.key, spark_type));
        }
    }
    columns
}

pub fn line_item_columns() -> &'static [(&'static str, &'static str)] {
    LINE_ITEM_COLUMNS
}

/// Row counts reported by the statement (or computed locally).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub documents: u64,
    pub header_rows: u64,
    pub line_item_rows: u64,
    /// True when no artifacts existed and the tables were left untouched.
    #[serde(default)]
    pub skipped: bool,
}

impl LoadSummary {
    pub fn print(&self, header_table: &str, line_item_table: &str) {
        println!("load");
        if self.skipped {
            println!("  no normalized documents, tables left unchanged");
        }
        println!("  documents: {}", self.documents);
        println!("  {}: {} rows", header_table, self.header_rows);
        println!("  {}: {} rows", line_item_table, self.line_item_rows);
        println!("ok");
    }
}

#[derive(Debug, Clone)]
pub struct TableLoadJob {
    /// Directories holding normalized artifacts, one per category.
    pub sources: Vec<String>,
    pub header_table: String,
    pub line_item_table: String,
}

impl TableLoadJob {
    pub fn from_config(config: &Config) -> Self {
        let sources = config
            .categories
            .iter()
            .map(|(name, category)| category.paths(&config.storage.root, name).output_dir)
            .collect();
        Self {
            sources,
            header_table: config.tables.header_table.clone(),
            line_item_table: config.tables.line_item_table.clone(),
        }
    }

    /// Render the PySpark statement.
    pub fn code(&self) -> String {
        let header_columns = header_columns();
        let line_columns = line_item_columns();
        PYSPARK_TEMPLATE
            .replace("__SOURCES__", &py_json(&self.sources))
            .replace("__HEADER_COLUMNS__", &py_columns(&header_columns))
            .replace("__LINE_COLUMNS__", &py_columns(line_columns))
            .replace("__LINE_DDL__", &py_json(&ddl(line_columns)))
            .replace("__HEADER_KEY__", &py_json(&HEADER_KEY))
            .replace("__LINE_KEY__", &py_json(&LINE_ITEM_KEY))
            .replace("__HEADER_TABLE__", &py_json(&self.header_table))
            .replace("__LINE_TABLE__", &py_json(&self.line_item_table))
            .replace("__MARKER__", &py_json(&SUMMARY_MARKER))
    }
}

/// Extract the summary line from the statement's printed output.
pub fn parse_summary(text: &str) -> Result<LoadSummary> {
    let line = text
        .lines()
        .rev()
        .find_map(|l| l.trim_start().strip_prefix(SUMMARY_MARKER))
        .context("Statement output has no load summary")?;
    serde_json::from_str(line.trim()).context("Invalid load summary")
}

pub type Row = BTreeMap<String, Value>;

/// Header and line-item rows as the tables would hold them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projection {
    pub headers: Vec<Row>,
    pub line_items: Vec<Row>,
}

impl Projection {
    pub fn summary(&self, documents: usize) -> LoadSummary {
        LoadSummary {
            documents: documents as u64,
            header_rows: self.headers.len() as u64,
            line_item_rows: self.line_items.len() as u64,
            skipped: documents == 0,
        }
    }
}

/// Local version of the statement's projection and dedup.
///
/// The first occurrence of a natural key wins.
pub fn project_rows(documents: &[NormalizedDocument]) -> Projection {
    let header_columns = header_columns();
    let mut projection = Projection::default();
    let mut seen_headers: HashSet<String> = HashSet::new();
    let mut seen_lines: HashSet<String> = HashSet::new();

    for document in documents {
        let mut header = Row::new();
        for (column, _) in &header_columns {
            let value = document.header.get(*column).cloned().unwrap_or(Value::Null);
            header.insert(column.to_string(), value);
        }
        if seen_headers.insert(natural_key(&header, &HEADER_KEY)) {
            projection.headers.push(header);
        }

        for item in &document.line_items {
            let mut row = Row::new();
            for key in ["document_id", "source_path", "category"] {
                row.insert(
                    key.to_string(),
                    document.header.get(key).cloned().unwrap_or(Value::Null),
                );
            }
            let item = match serde_json::to_value(item) {
                Ok(Value::Object(map)) => map,
                _ => continue,
            };
            for (column, _) in LINE_ITEM_COLUMNS.iter().skip(3) {
                row.insert(
                    column.to_string(),
                    item.get(*column).cloned().unwrap_or(Value::Null),
                );
            }
            if seen_lines.insert(natural_key(&row, &LINE_ITEM_KEY)) {
                projection.line_items.push(row);
            }
        }
    }
    projection
}

fn natural_key(row: &Row, columns: &[&str]) -> String {
    let parts: Vec<&Value> = columns
        .iter()
        .map(|c| row.get(*c).unwrap_or(&Value::Null))
        .collect();
    serde_json::to_string(&parts).unwrap_or_default()
}

/// JSON literals double as Python literals for strings and lists of strings.
fn py_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "None".to_string())
}

fn py_columns(columns: &[(&str, &str)]) -> String {
    let pairs: Vec<[&str; 2]> = columns.iter().map(|(n, t)| [*n, *t]).collect();
    py_json(&pairs)
}

fn ddl(columns: &[(&str, &str)]) -> String {
    columns
        .iter()
        .map(|(n, t)| format!("{} {}", n, t))
        .collect::<Vec<_>>()
        .join(", ")
}

const PYSPARK_TEMPLATE: &str = r#"import json
from functools import reduce
from pyspark.sql import functions as F
from pyspark.sql.utils import AnalysisException

SOURCES = __SOURCES__
HEADER_COLUMNS = __HEADER_COLUMNS__
LINE_COLUMNS = __LINE_COLUMNS__
HEADER_KEY = __HEADER_KEY__
LINE_KEY = __LINE_KEY__


def read_source(path):
    try:
        return (
            spark.read.option("multiLine", "true")
            .option("recursiveFileLookup", "true")
            .option("pathGlobFilter", "*.json")
            .json(path)
        )
    except AnalysisException:
        return None


def project(df, struct_col, fields, columns):
    return [
        (F.col(struct_col + "." + name) if name in fields else F.lit(None)).cast(kind).alias(name)
        for name, kind in columns
    ]


frames = [df for df in (read_source(p) for p in SOURCES) if df is not None and "header" in df.columns]

if not frames:
    summary = {"documents": 0, "header_rows": 0, "line_item_rows": 0, "skipped": True}
else:
    docs = reduce(lambda a, b: a.unionByName(b, allowMissingColumns=True), frames)
    header_fields = set(docs.schema["header"].dataType.fieldNames())
    headers = docs.select(*project(docs, "header", header_fields, HEADER_COLUMNS)).dropDuplicates(HEADER_KEY)

    item_fields = set()
    if "line_items" in docs.columns:
        element = docs.schema["line_items"].dataType.elementType
        if hasattr(element, "fieldNames"):
            item_fields = set(element.fieldNames())
    if item_fields:
        exploded = docs.select(
            F.col("header.document_id").alias("document_id"),
            F.col("header.source_path").alias("source_path"),
            F.col("header.category").alias("category"),
            F.explode("line_items").alias("item"),
        )
        item_columns = [(n, k) for n, k in LINE_COLUMNS if n not in ("document_id", "source_path", "category")]
        lines = exploded.select(
            F.col("document_id").cast("string"),
            F.col("source_path").cast("string"),
            F.col("category").cast("string"),
            *project(exploded, "item", item_fields, item_columns),
        ).dropDuplicates(LINE_KEY)
    else:
        lines = spark.createDataFrame([], __LINE_DDL__)

    headers.write.mode("overwrite").option("overwriteSchema", "true").format("delta").saveAsTable(__HEADER_TABLE__)
    lines.write.mode("overwrite").option("overwriteSchema", "true").format("delta").saveAsTable(__LINE_TABLE__)
    summary = {
        "documents": docs.count(),
        "header_rows": headers.count(),
        "line_item_rows": lines.count(),
        "skipped": False,
    }

print(__MARKER__ + json.dumps(summary))
"#;
