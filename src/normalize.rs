//! Field normalization: analysis result → [`NormalizedDocument`].
//!
//! The analysis service returns one loosely typed field tree per analyzed
//! document. Each field ("cell") may carry several typed representations
//! (`valueString`, `valueCurrency`, `valueNumber`, ...). This module turns
//! that tree into a fixed record shape using an explicit [`FieldSchema`]
//! table: every header key and line-item column is named up front together
//! with the [`Rule`] that extracts it. Nothing here depends on the order in
//! which the service happened to emit keys.
//!
//! Only the first analyzed document of a result is read. A file that the
//! service splits into several documents contributes its first segment.

use anyhow::{bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::models::{AnalysisResult, LineItem, NormalizedDocument, NORMALIZED_SCHEMA_VERSION};

/// Typed representations of a cell, in the order [`cell_value`] tries them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    String,
    Currency,
    Number,
    Integer,
    Date,
    SelectionMark,
    PhoneNumber,
    Signature,
    Content,
}

pub const CELL_PRECEDENCE: [CellKind; 9] = [
    CellKind::String,
    CellKind::Currency,
    CellKind::Number,
    CellKind::Integer,
    CellKind::Date,
    CellKind::SelectionMark,
    CellKind::PhoneNumber,
    CellKind::Signature,
    CellKind::Content,
];

fn extract(kind: CellKind, cell: &Value) -> Option<Value> {
    let text = |key: &str| {
        cell.get(key)
            .and_then(Value::as_str)
            .map(|s| Value::String(s.to_string()))
    };
    match kind {
        CellKind::String => text("valueString"),
        CellKind::Currency => cell
            .get("valueCurrency")
            .and_then(|c| c.get("amount"))
            .filter(|a| a.is_number())
            .cloned(),
        CellKind::Number => cell.get("valueNumber").filter(|n| n.is_number()).cloned(),
        CellKind::Integer => cell.get("valueInteger").filter(|n| n.is_i64() || n.is_u64()).cloned(),
        CellKind::Date => text("valueDate"),
        CellKind::SelectionMark => text("valueSelectionMark"),
        CellKind::PhoneNumber => text("valuePhoneNumber"),
        CellKind::Signature => text("valueSignature"),
        CellKind::Content => text("content"),
    }
}

/// First representation present in [`CELL_PRECEDENCE`] order, else null.
pub fn cell_value(cell: &Value) -> Value {
    CELL_PRECEDENCE
        .iter()
        .find_map(|kind| extract(*kind, cell))
        .unwrap_or(Value::Null)
}

/// How one schema field is read from its cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Generic precedence ([`cell_value`]).
    Text,
    /// Currency amount, then number, then integer. Never a string.
    Amount,
    /// Number, then integer.
    Number,
    /// `valueDate`, then raw content.
    Date,
    /// Structured address joined with `", "`, then raw content.
    Address,
}

/// One entry of a schema table: service field name → output key.
#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub source: &'static str,
    pub key: &'static str,
    pub rule: Rule,
}

const fn field(source: &'static str, key: &'static str, rule: Rule) -> FieldRule {
    FieldRule { source, key, rule }
}

/// Field table for one family of analysis models.
#[derive(Debug)]
pub struct FieldSchema {
    pub name: &'static str,
    /// Field holding the document's own identifier, if the model has one.
    pub id_field: Option<&'static str>,
    pub header: &'static [FieldRule],
    /// Total-like fields consulted, in order, for the currency code.
    pub currency_candidates: &'static [&'static str],
    /// Repeated field holding the line items.
    pub items_field: &'static str,
    /// Columns of each line item; keys are [`LineItem`] field names.
    pub line: &'static [FieldRule],
}

pub static INVOICE_SCHEMA: FieldSchema = FieldSchema {
    name: "invoice",
    id_field: Some("InvoiceId"),
    header: &[
        field("InvoiceDate", "invoice_date", Rule::Date),
        field("DueDate", "due_date", Rule::Date),
        field("PurchaseOrder", "purchase_order", Rule::Text),
        field("VendorName", "vendor_name", Rule::Text),
        field("VendorAddress", "vendor_address", Rule::Address),
        field("VendorTaxId", "vendor_tax_id", Rule::Text),
        field("CustomerName", "customer_name", Rule::Text),
        field("CustomerId", "customer_id", Rule::Text),
        field("CustomerAddress", "customer_address", Rule::Address),
        field("BillingAddress", "billing_address", Rule::Address),
        field("PaymentTerm", "payment_terms", Rule::Text),
        field("SubTotal", "subtotal", Rule::Amount),
        field("TotalTax", "total_tax", Rule::Amount),
        field("InvoiceTotal", "total_amount", Rule::Amount),
        field("AmountDue", "amount_due", Rule::Amount),
    ],
    currency_candidates: &["InvoiceTotal", "AmountDue", "SubTotal", "TotalTax"],
    items_field: "Items",
    line: &[
        field("Description", "description", Rule::Text),
        field("Quantity", "quantity", Rule::Number),
        field("Unit", "unit", Rule::Text),
        field("UnitPrice", "unit_price", Rule::Amount),
        field("Amount", "amount", Rule::Amount),
        field("ProductCode", "product_code", Rule::Text),
        field("Tax", "tax", Rule::Amount),
        field("Date", "date", Rule::Date),
    ],
};

pub static RECEIPT_SCHEMA: FieldSchema = FieldSchema {
    name: "receipt",
    id_field: None,
    header: &[
        field("MerchantName", "vendor_name", Rule::Text),
        field("MerchantAddress", "vendor_address", Rule::Address),
        field("MerchantPhoneNumber", "vendor_phone", Rule::Text),
        field("TransactionDate", "transaction_date", Rule::Date),
        field("TransactionTime", "transaction_time", Rule::Text),
        field("Subtotal", "subtotal", Rule::Amount),
        field("TotalTax", "total_tax", Rule::Amount),
        field("Tip", "tip", Rule::Amount),
        field("Total", "total_amount", Rule::Amount),
    ],
    currency_candidates: &["Total", "Subtotal", "TotalTax"],
    items_field: "Items",
    line: &[
        field("Description", "description", Rule::Text),
        field("Quantity", "quantity", Rule::Number),
        field("Price", "unit_price", Rule::Amount),
        field("TotalPrice", "amount", Rule::Amount),
        field("ProductCode", "product_code", Rule::Text),
    ],
};

pub fn schema_by_name(name: &str) -> Option<&'static FieldSchema> {
    match name {
        "invoice" => Some(&INVOICE_SCHEMA),
        "receipt" => Some(&RECEIPT_SCHEMA),
        _ => None,
    }
}

/// Per-file values the normalizer stamps into the header.
#[derive(Debug, Clone)]
pub struct NormalizeContext {
    pub source_path: String,
    pub category: String,
    pub normalized_at: DateTime<Utc>,
    /// Used as `document_id` when the analysis does not provide one.
    pub fallback_document_id: String,
}

/// Normalize one analysis result.
///
/// Fails only if the payload has no `analyzeResult` object at all; a result
/// without analyzed documents still produces a record with null fields.
pub fn normalize(
    result: &AnalysisResult,
    schema: &FieldSchema,
    context: &NormalizeContext,
) -> Result<NormalizedDocument> {
    let analyze = match result.raw.get("analyzeResult") {
        Some(Value::Object(obj)) => obj,
        _ => bail!("analysis payload has no analyzeResult object"),
    };

    let document = analyze
        .get("documents")
        .and_then(Value::as_array)
        .and_then(|docs| docs.first());
    let empty = Map::new();
    let fields = document
        .and_then(|d| d.get("fields"))
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let mut header: BTreeMap<String, Value> = BTreeMap::new();

    let extracted_id = schema
        .id_field
        .and_then(|name| fields.get(name))
        .map(|cell| scalar_to_string(&cell_value(cell)))
        .filter(|id| !id.trim().is_empty());
    let generated = extracted_id.is_none();
    let document_id = extracted_id.unwrap_or_else(|| context.fallback_document_id.clone());
    header.insert("document_id".into(), Value::String(document_id));
    header.insert("document_id_generated".into(), Value::Bool(generated));

    for rule in schema.header {
        let value = fields
            .get(rule.source)
            .map(|cell| apply_rule(rule.rule, cell))
            .unwrap_or(Value::Null);
        header.insert(rule.key.to_string(), value);
    }

    header.insert(
        "currency_code".into(),
        currency_code(fields, schema.currency_candidates)
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    header.insert(
        "doc_type".into(),
        document
            .and_then(|d| d.get("docType"))
            .cloned()
            .unwrap_or(Value::Null),
    );
    header.insert(
        "confidence".into(),
        document
            .and_then(|d| d.get("confidence"))
            .filter(|c| c.is_number())
            .cloned()
            .unwrap_or(Value::Null),
    );

    let model_id = analyze
        .get("modelId")
        .and_then(Value::as_str)
        .unwrap_or(result.model_id.as_str());
    let api_version = analyze
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or(result.api_version.as_str());
    header.insert("model_id".into(), Value::String(model_id.to_string()));
    header.insert("api_version".into(), Value::String(api_version.to_string()));
    header.insert("schema".into(), Value::String(schema.name.to_string()));
    header.insert(
        "source_path".into(),
        Value::String(context.source_path.clone()),
    );
    header.insert("category".into(), Value::String(context.category.clone()));
    header.insert(
        "normalized_at".into(),
        Value::String(
            context
                .normalized_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
    );

    let line_items = fields
        .get(schema.items_field)
        .map(|cell| line_items(cell, schema.line))
        .unwrap_or_default();

    Ok(NormalizedDocument {
        schema_version: NORMALIZED_SCHEMA_VERSION,
        header,
        line_items,
    })
}

fn apply_rule(rule: Rule, cell: &Value) -> Value {
    let first = |kinds: &[CellKind]| {
        kinds
            .iter()
            .find_map(|kind| extract(*kind, cell))
            .unwrap_or(Value::Null)
    };
    match rule {
        Rule::Text => cell_value(cell),
        Rule::Amount => first(&[CellKind::Currency, CellKind::Number, CellKind::Integer]),
        Rule::Number => first(&[CellKind::Number, CellKind::Integer]),
        Rule::Date => first(&[CellKind::Date, CellKind::Content]),
        Rule::Address => address(cell)
            .map(Value::String)
            .or_else(|| extract(CellKind::Content, cell))
            .unwrap_or(Value::Null),
    }
}

/// Join the structured address parts present, in fixed order.
fn address(cell: &Value) -> Option<String> {
    let addr = cell.get("valueAddress")?.as_object()?;
    let part = |key: &str| {
        addr.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let street = part("streetAddress").or_else(|| {
        let joined = [part("houseNumber"), part("road")]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        (!joined.is_empty()).then_some(joined)
    });

    let parts: Vec<String> = [
        street,
        part("city"),
        part("state"),
        part("postalCode"),
        part("countryRegion"),
    ]
    .into_iter()
    .flatten()
    .collect();

    (!parts.is_empty()).then(|| parts.join(", "))
}

fn currency_code(fields: &Map<String, Value>, candidates: &[&str]) -> Option<String> {
    candidates.iter().find_map(|name| {
        fields
            .get(*name)
            .and_then(|cell| cell.get("valueCurrency"))
            .and_then(|c| c.get("currencyCode"))
            .and_then(Value::as_str)
            .filter(|code| !code.trim().is_empty())
            .map(str::to_string)
    })
}

fn line_items(cell: &Value, columns: &[FieldRule]) -> Vec<LineItem> {
    let entries = match cell.get("valueArray").and_then(Value::as_array) {
        Some(entries) => entries,
        None => return Vec::new(),
    };

    let mut items = Vec::new();
    for entry in entries {
        let Some(object) = entry.get("valueObject").and_then(Value::as_object) else {
            continue;
        };
        let mut item = LineItem {
            line_number: items.len() as u32 + 1,
            ..LineItem::default()
        };
        for column in columns {
            let Some(value_cell) = object.get(column.source) else {
                continue;
            };
            let value = apply_rule(column.rule, value_cell);
            match column.key {
                "description" => item.description = as_text(&value),
                "quantity" => item.quantity = value.as_f64(),
                "unit" => item.unit = as_text(&value),
                "unit_price" => item.unit_price = value.as_f64(),
                "amount" => item.amount = value.as_f64(),
                "product_code" => item.product_code = as_text(&value),
                "tax" => item.tax = value.as_f64(),
                "date" => item.date = as_text(&value),
                other => tracing::debug!(column = other, "unmapped line item column"),
            }
        }
        items.push(item);
    }
    items
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        other => Some(scalar_to_string(other)),
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
