use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use lakeflow::analyzer::DocumentAnalyzer;
use lakeflow::config::{parse_config, Config};
use lakeflow::models::{AnalysisResult, ManifestEntry, NormalizedDocument};
use lakeflow::normalize::{normalize, schema_by_name, NormalizeContext};
use lakeflow::pipeline::{DocumentPipeline, FileOutcome, RunOptions};
use lakeflow::progress::{NoProgress, ProgressEvent, ProgressReporter};
use lakeflow::store::{download_json, upload_json, MemoryStore, ObjectStore};
use serde_json::{json, Value};

/// Analyzer that answers from the document bytes: `fail:*` errors, anything
/// else yields an invoice whose id is the content.
struct ScriptedAnalyzer {
    calls: AtomicUsize,
    content_types: Mutex<Vec<String>>,
}

impl ScriptedAnalyzer {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            content_types: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn invoice_payload(id: &str) -> Value {
    json!({
        "status": "succeeded",
        "analyzeResult": {
            "apiVersion": "2023-07-31",
            "modelId": "prebuilt-invoice",
            "documents": [{
                "docType": "invoice",
                "confidence": 0.97,
                "fields": {
                    "InvoiceId": {"type": "string", "valueString": id, "content": id},
                    "VendorName": {"type": "string", "valueString": "Contoso", "content": "CONTOSO"},
                    "InvoiceTotal": {
                        "type": "currency",
                        "valueCurrency": {"amount": 110.0, "currencyCode": "USD"},
                        "valueString": "110 dollars",
                        "content": "$110.00"
                    },
                    "Items": {"type": "array", "valueArray": [
                        {"type": "object", "valueObject": {
                            "Description": {"type": "string", "valueString": "Widget"},
                            "Quantity": {"type": "number", "valueNumber": 2},
                            "Amount": {"type": "currency", "valueCurrency": {"amount": 100.0}}
                        }},
                        {"type": "object", "valueObject": {
                            "Description": {"type": "string", "valueString": "Shipping"},
                            "Amount": {"type": "currency", "valueCurrency": {"amount": 10.0}}
                        }}
                    ]}
                }
            }]
        }
    })
}

#[async_trait]
impl DocumentAnalyzer for ScriptedAnalyzer {
    async fn analyze(
        &self,
        model_id: &str,
        content: &[u8],
        content_type: &str,
    ) -> Result<AnalysisResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.content_types
            .lock()
            .unwrap()
            .push(content_type.to_string());
        let text = String::from_utf8_lossy(content).to_string();
        if text.starts_with("fail:") {
            bail!("analysis with model '{}' failed: InvalidContent", model_id);
        }
        Ok(AnalysisResult {
            model_id: model_id.to_string(),
            api_version: "2023-07-31".to_string(),
            raw: invoice_payload(&text),
        })
    }
}

/// Delegates to a [`MemoryStore`], failing directory creation under
/// `broken_prefix` and the first `manifest_failures` manifest uploads.
struct FaultyStore {
    inner: MemoryStore,
    broken_prefix: Option<&'static str>,
    manifest_failures: AtomicUsize,
}

impl FaultyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            broken_prefix: None,
            manifest_failures: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn ensure_directory(&self, path: &str) -> Result<()> {
        if let Some(prefix) = self.broken_prefix {
            if path.starts_with(prefix) {
                bail!("create directory failed for '{}' (HTTP 403)", path);
            }
        }
        self.inner.ensure_directory(path).await
    }
    async fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path).await
    }
    async fn list_files(&self, directory: &str) -> Result<Vec<String>> {
        self.inner.list_files(directory).await
    }
    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.download(path).await
    }
    async fn upload_bytes(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let fail = path.ends_with(".manifest.json")
            && self
                .manifest_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if fail {
            bail!("flush failed for '{}' (HTTP 500)", path);
        }
        self.inner.upload_bytes(path, bytes).await
    }
    async fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(path).await
    }
}

#[derive(Default)]
struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressReporter for RecordingProgress {
    fn report(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn config() -> Config {
    parse_config(
        r#"
[pipeline]
max_documents_per_category = 50

[categories.invoices]
model_id = "prebuilt-invoice"
schema = "invoice"

[categories.receipts]
model_id = "prebuilt-receipt"
schema = "receipt"
"#,
    )
    .unwrap()
}

fn artifacts(store: &MemoryStore, dir: &str) -> Vec<String> {
    store
        .paths()
        .into_iter()
        .filter(|p| p.starts_with(dir))
        .collect()
}

#[tokio::test]
async fn valid_and_empty_invoice() {
    let store = MemoryStore::new();
    store.insert("Files/raw/invoices/invoice-1.pdf", "INV-001");
    store.insert("Files/raw/invoices/invoice-2.pdf", Vec::new());
    let analyzer = ScriptedAnalyzer::new();

    let pipeline = DocumentPipeline::new(&store, &analyzer, &NoProgress);
    let report = pipeline
        .run(
            &config(),
            &RunOptions {
                only: vec!["invoices".to_string()],
                ..Default::default()
            },
        )
        .await;

    assert_eq!(report.categories.len(), 1);
    let invoices = &report.categories[0];
    assert_eq!(invoices.listed, 2);
    assert_eq!(invoices.persisted(), 1);
    assert_eq!(invoices.skipped_empty(), 1);
    assert_eq!(invoices.failed(), 0);
    assert_eq!(analyzer.calls(), 1);

    assert_eq!(
        artifacts(&store, "Files/normalized/"),
        vec!["Files/normalized/invoices/invoice-1.pdf.json"]
    );
    let manifests = artifacts(&store, "Files/processed/");
    assert_eq!(
        manifests,
        vec!["Files/processed/invoices/invoice-1.pdf.manifest.json"]
    );
    assert!(!manifests.iter().any(|m| m.contains("invoice-2")));

    let doc: NormalizedDocument =
        download_json(&store, "Files/normalized/invoices/invoice-1.pdf.json")
            .await
            .unwrap();
    assert_eq!(doc.document_id(), "INV-001");
    assert_eq!(doc.header["total_amount"], json!(110.0));
    assert_eq!(doc.header["currency_code"], json!("USD"));
    assert_eq!(doc.header["source_path"], json!("Files/raw/invoices/invoice-1.pdf"));
    assert_eq!(doc.line_items.len(), 2);
    assert_eq!(doc.line_items[1].line_number, 2);

    let manifest: ManifestEntry =
        download_json(&store, "Files/processed/invoices/invoice-1.pdf.manifest.json")
            .await
            .unwrap();
    assert_eq!(manifest.document_id, "INV-001");
    assert_eq!(manifest.line_item_count, 2);
    assert_eq!(manifest.source_bytes, 7);
    assert_eq!(manifest.model_id, "prebuilt-invoice");
    assert_eq!(manifest.source_sha256.len(), 64);

    assert_eq!(
        analyzer.content_types.lock().unwrap().as_slice(),
        ["application/pdf".to_string()]
    );
}

#[tokio::test]
async fn second_run_performs_no_analysis() {
    let store = MemoryStore::new();
    store.insert("Files/raw/invoices/a.pdf", "INV-A");
    store.insert("Files/raw/invoices/b.jpg", "INV-B");
    store.insert("Files/raw/receipts/r.png", "R-1");
    let analyzer = ScriptedAnalyzer::new();
    let pipeline = DocumentPipeline::new(&store, &analyzer, &NoProgress);
    let cfg = config();

    let first = pipeline.run(&cfg, &RunOptions::default()).await;
    assert_eq!(first.persisted(), 3);
    let after_first = store.paths();
    let first_artifact = store.get("Files/normalized/invoices/a.pdf.json").unwrap();
    assert_eq!(analyzer.calls(), 3);

    let second = pipeline.run(&cfg, &RunOptions::default()).await;
    assert_eq!(analyzer.calls(), 3, "second run must not call the analyzer");
    assert_eq!(second.persisted(), 0);
    assert_eq!(
        second
            .categories
            .iter()
            .map(|c| c.skipped_existing())
            .sum::<usize>(),
        3
    );
    assert_eq!(store.paths(), after_first);
    assert_eq!(
        store.get("Files/normalized/invoices/a.pdf.json").unwrap(),
        first_artifact
    );
}

#[tokio::test]
async fn force_reprocesses_existing_artifacts() {
    let store = MemoryStore::new();
    store.insert("Files/raw/invoices/a.pdf", "INV-A");
    let analyzer = ScriptedAnalyzer::new();
    let pipeline = DocumentPipeline::new(&store, &analyzer, &NoProgress);
    let cfg = config();

    pipeline.run(&cfg, &RunOptions::default()).await;
    let forced = pipeline
        .run(
            &cfg,
            &RunOptions {
                force: true,
                ..Default::default()
            },
        )
        .await;
    assert_eq!(analyzer.calls(), 2);
    assert_eq!(forced.persisted(), 1);
    assert_eq!(artifacts(&store, "Files/processed/").len(), 1);
}

#[tokio::test]
async fn one_failing_document_does_not_stop_the_batch() {
    let store = MemoryStore::new();
    store.insert("Files/raw/invoices/a.pdf", "INV-A");
    store.insert("Files/raw/invoices/b.pdf", "fail:corrupt");
    store.insert("Files/raw/invoices/c.pdf", "INV-C");
    let analyzer = ScriptedAnalyzer::new();
    let pipeline = DocumentPipeline::new(&store, &analyzer, &NoProgress);

    let report = pipeline.run(&config(), &RunOptions::default()).await;
    let invoices = &report.categories[0];
    assert_eq!(invoices.persisted(), 2);
    assert_eq!(invoices.failed(), 1);
    assert_eq!(analyzer.calls(), 3);

    let failure = &invoices.files[1];
    assert_eq!(failure.source_path, "Files/raw/invoices/b.pdf");
    match &failure.outcome {
        FileOutcome::Failed(message) => assert!(message.contains("InvalidContent"), "{}", message),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(store.get("Files/normalized/invoices/b.pdf.json").is_none());
    assert!(store
        .get("Files/processed/invoices/b.pdf.manifest.json")
        .is_none());
    assert!(store.get("Files/normalized/invoices/c.pdf.json").is_some());

    // The failed document is retried on the next run; the others are not.
    let retry = pipeline.run(&config(), &RunOptions::default()).await;
    assert_eq!(analyzer.calls(), 4);
    assert_eq!(retry.failed(), 1);
}

#[tokio::test]
async fn directory_failure_aborts_only_that_category() {
    let store = FaultyStore {
        broken_prefix: Some("Files/normalized/invoices"),
        ..FaultyStore::new()
    };
    store.inner.insert("Files/raw/invoices/a.pdf", "INV-A");
    store.inner.insert("Files/raw/receipts/r.pdf", "R-1");
    let analyzer = ScriptedAnalyzer::new();
    let pipeline = DocumentPipeline::new(&store, &analyzer, &NoProgress);

    let report = pipeline.run(&config(), &RunOptions::default()).await;
    assert_eq!(report.categories.len(), 2);
    let invoices = &report.categories[0];
    assert!(invoices.error.as_deref().unwrap().contains("HTTP 403"));
    assert!(invoices.files.is_empty());

    let receipts = &report.categories[1];
    assert!(receipts.error.is_none());
    assert_eq!(receipts.persisted(), 1);
    assert_eq!(analyzer.calls(), 1);
}

#[tokio::test]
async fn cap_defers_files_in_listing_order() {
    let store = MemoryStore::new();
    for name in ["d.pdf", "a.pdf", "c.pdf", "b.pdf"] {
        store.insert(&format!("Files/raw/invoices/{}", name), format!("ID-{}", name));
    }
    let analyzer = ScriptedAnalyzer::new();
    let pipeline = DocumentPipeline::new(&store, &analyzer, &NoProgress);
    let options = RunOptions {
        limit: Some(2),
        only: vec!["invoices".to_string()],
        ..Default::default()
    };

    let first = pipeline.run(&config(), &options).await;
    let invoices = &first.categories[0];
    assert_eq!(invoices.listed, 4);
    assert_eq!(invoices.capped, 2);
    let handled: Vec<&str> = invoices.files.iter().map(|f| f.source_path.as_str()).collect();
    assert_eq!(
        handled,
        vec!["Files/raw/invoices/a.pdf", "Files/raw/invoices/b.pdf"]
    );

    // Already-processed files are passed over and the cap goes to the rest.
    let second = pipeline.run(&config(), &options).await;
    let invoices = &second.categories[0];
    assert_eq!(invoices.skipped_existing(), 2);
    assert_eq!(invoices.persisted(), 2);
    assert_eq!(invoices.capped, 0);
    assert_eq!(analyzer.calls(), 4);
    assert!(store.get("Files/normalized/invoices/c.pdf.json").is_some());
    assert!(store.get("Files/normalized/invoices/d.pdf.json").is_some());

    let third = pipeline.run(&config(), &options).await;
    assert_eq!(third.categories[0].skipped_existing(), 4);
    assert_eq!(analyzer.calls(), 4);
}

#[tokio::test]
async fn empty_files_do_not_use_up_the_cap() {
    let store = MemoryStore::new();
    store.insert("Files/raw/invoices/a.pdf", Vec::new());
    store.insert("Files/raw/invoices/b.pdf", "INV-B");
    let analyzer = ScriptedAnalyzer::new();
    let pipeline = DocumentPipeline::new(&store, &analyzer, &NoProgress);

    let report = pipeline
        .run(
            &config(),
            &RunOptions {
                limit: Some(1),
                only: vec!["invoices".to_string()],
                ..Default::default()
            },
        )
        .await;
    let invoices = &report.categories[0];
    assert_eq!(invoices.skipped_empty(), 1);
    assert_eq!(invoices.persisted(), 1);
    assert_eq!(invoices.capped, 0);
}

#[tokio::test]
async fn failed_manifest_write_leaves_nothing_and_is_retried() {
    let store = FaultyStore::new();
    store.manifest_failures.store(1, Ordering::SeqCst);
    store.inner.insert("Files/raw/invoices/a.pdf", "INV-A");
    let analyzer = ScriptedAnalyzer::new();
    let pipeline = DocumentPipeline::new(&store, &analyzer, &NoProgress);

    let first = pipeline.run(&config(), &RunOptions::default()).await;
    assert_eq!(first.failed(), 1);
    match &first.categories[0].files[0].outcome {
        FileOutcome::Failed(message) => {
            assert!(message.contains("writing manifest entry failed"), "{}", message)
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(store.inner.get("Files/normalized/invoices/a.pdf.json").is_none());
    assert!(store
        .inner
        .get("Files/processed/invoices/a.pdf.manifest.json")
        .is_none());

    let second = pipeline.run(&config(), &RunOptions::default()).await;
    assert_eq!(second.categories[0].skipped_existing(), 0);
    assert_eq!(second.persisted(), 1);
    assert_eq!(analyzer.calls(), 2);
    assert!(store.inner.get("Files/normalized/invoices/a.pdf.json").is_some());
    assert!(store
        .inner
        .get("Files/processed/invoices/a.pdf.manifest.json")
        .is_some());
}

#[tokio::test]
async fn progress_reports_each_file_outcome() {
    let store = MemoryStore::new();
    store.insert("Files/raw/invoices/a.pdf", "INV-A");
    store.insert("Files/raw/invoices/b.pdf", Vec::new());
    let analyzer = ScriptedAnalyzer::new();
    let progress = RecordingProgress::default();
    let pipeline = DocumentPipeline::new(&store, &analyzer, &progress);

    pipeline
        .run(
            &config(),
            &RunOptions {
                only: vec!["invoices".to_string()],
                ..Default::default()
            },
        )
        .await;

    let events = progress.events.lock().unwrap();
    assert_eq!(
        events.as_slice(),
        [
            ProgressEvent::Listed {
                category: "invoices".to_string(),
                files: 2,
            },
            ProgressEvent::Document {
                category: "invoices".to_string(),
                n: 1,
                listed: 2,
                path: "Files/raw/invoices/a.pdf".to_string(),
                outcome: "persisted",
            },
            ProgressEvent::Document {
                category: "invoices".to_string(),
                n: 2,
                listed: 2,
                path: "Files/raw/invoices/b.pdf".to_string(),
                outcome: "skipped (empty)",
            },
            ProgressEvent::CategoryDone {
                category: "invoices".to_string(),
                persisted: 1,
                skipped: 1,
                failed: 0,
                capped: 0,
                error: None,
            },
        ]
    );
}

#[tokio::test]
async fn dry_run_touches_nothing() {
    let store = MemoryStore::new();
    store.insert("Files/raw/invoices/a.pdf", "INV-A");
    store.insert("Files/raw/invoices/b.pdf", "INV-B");
    store.insert("Files/normalized/invoices/b.pdf.json", "{}");
    let analyzer = ScriptedAnalyzer::new();
    let pipeline = DocumentPipeline::new(&store, &analyzer, &NoProgress);

    let report = pipeline
        .run(
            &config(),
            &RunOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .await;
    let invoices = &report.categories[0];
    assert_eq!(invoices.pending(), 1);
    assert_eq!(invoices.skipped_existing(), 1);
    assert_eq!(analyzer.calls(), 0);
    assert_eq!(store.download_count(), 0);
    assert_eq!(store.upload_count(), 0);
    assert!(!store.has_directory("Files/processed/invoices"));
}

#[tokio::test]
async fn unknown_requested_category_is_reported() {
    let store = MemoryStore::new();
    let analyzer = ScriptedAnalyzer::new();
    let pipeline = DocumentPipeline::new(&store, &analyzer, &NoProgress);

    let report = pipeline
        .run(
            &config(),
            &RunOptions {
                only: vec!["invoices".to_string(), "contracts".to_string()],
                ..Default::default()
            },
        )
        .await;
    assert_eq!(report.unknown_categories, vec!["contracts".to_string()]);
    assert_eq!(report.categories.len(), 1);
    assert!(store.has_directory("Files/normalized/invoices"));
    assert!(store.has_directory("Files/processed/invoices"));
}

#[tokio::test]
async fn unknown_schema_skips_only_that_category() {
    let cfg = parse_config(
        r#"
[categories.contracts]
model_id = "prebuilt-contract"
schema = "contract"

[categories.invoices]
model_id = "prebuilt-invoice"
"#,
    )
    .unwrap();
    let store = MemoryStore::new();
    store.insert("Files/raw/contracts/c.pdf", "C-1");
    store.insert("Files/raw/invoices/a.pdf", "INV-A");
    let analyzer = ScriptedAnalyzer::new();
    let pipeline = DocumentPipeline::new(&store, &analyzer, &NoProgress);

    let report = pipeline.run(&cfg, &RunOptions::default()).await;
    let contracts = &report.categories[0];
    assert_eq!(contracts.error.as_deref(), Some("unknown schema 'contract'"));
    assert!(contracts.files.is_empty());
    assert_eq!(report.categories[1].persisted(), 1);
    assert_eq!(analyzer.calls(), 1);
}

#[tokio::test]
async fn globs_filter_relative_paths() {
    let cfg = parse_config(
        r#"
[categories.invoices]
model_id = "prebuilt-invoice"
include_globs = ["**/*.pdf"]
exclude_globs = ["archive/**"]
"#,
    )
    .unwrap();
    let store = MemoryStore::new();
    store.insert("Files/raw/invoices/a.pdf", "INV-A");
    store.insert("Files/raw/invoices/notes.txt", "x");
    store.insert("Files/raw/invoices/archive/old.pdf", "INV-OLD");
    store.insert("Files/raw/invoices/2026/03/b.pdf", "INV-B");
    let analyzer = ScriptedAnalyzer::new();
    let pipeline = DocumentPipeline::new(&store, &analyzer, &NoProgress);

    let report = pipeline.run(&cfg, &RunOptions::default()).await;
    assert_eq!(report.categories[0].listed, 2);
    assert!(store
        .get("Files/normalized/invoices/2026/03/b.pdf.json")
        .is_some());
    assert!(store
        .get("Files/normalized/invoices/archive/old.pdf.json")
        .is_none());
}

#[tokio::test]
async fn artifact_round_trips_with_all_line_items() {
    let result = AnalysisResult {
        model_id: "prebuilt-invoice".to_string(),
        api_version: "2023-07-31".to_string(),
        raw: invoice_payload("INV-RT"),
    };
    let context = NormalizeContext {
        source_path: "Files/raw/invoices/rt.pdf".to_string(),
        category: "invoices".to_string(),
        normalized_at: Utc::now(),
        fallback_document_id: "unused".to_string(),
    };
    let written = normalize(&result, schema_by_name("invoice").unwrap(), &context).unwrap();

    let store = MemoryStore::new();
    let path = "Files/normalized/invoices/rt.pdf.json";
    upload_json(&store, path, &written).await.unwrap();
    let read: NormalizedDocument = download_json(&store, path).await.unwrap();

    assert_eq!(read, written);
    assert_eq!(read.line_items.len(), 2);
    assert_eq!(read.line_items[0].description.as_deref(), Some("Widget"));
    assert_eq!(read.line_items[0].quantity, Some(2.0));
}
