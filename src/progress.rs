//! Pipeline progress reporting.
//!
//! `lakeflow run` emits one event when a category is listed, one per
//! handled file (with its outcome) and one when the category is done.
//! Progress goes to **stderr** so the stdout report stays parseable.
//!
//! | Mode | Output |
//! |------|--------|
//! | `human` | `invoices [2/14] Files/raw/invoices/a.pdf: persisted` |
//! | `json` | `{"event":"document","category":"invoices","n":2,...}` |
//! | `off` | nothing |

use std::io::Write;

use serde_json::{json, Value};

#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// Source directory of a category listed and filtered.
    Listed { category: String, files: u64 },
    /// File `n` of the listing handled; `outcome` is a short label.
    Document {
        category: String,
        n: u64,
        listed: u64,
        path: String,
        outcome: &'static str,
    },
    /// Category finished (or aborted, with `error`).
    CategoryDone {
        category: String,
        persisted: u64,
        skipped: u64,
        failed: u64,
        capped: u64,
        error: Option<String>,
    },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// One human-readable line, without the trailing newline.
pub fn human_line(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::Listed { category, files } => {
            format!("{} listed {} file(s)", category, files)
        }
        ProgressEvent::Document {
            category,
            n,
            listed,
            path,
            outcome,
        } => format!("{} [{}/{}] {}: {}", category, n, listed, path, outcome),
        ProgressEvent::CategoryDone {
            category,
            error: Some(error),
            ..
        } => format!("{} aborted: {}", category, error),
        ProgressEvent::CategoryDone {
            category,
            persisted,
            skipped,
            failed,
            capped,
            error: None,
        } => {
            let mut line = format!(
                "{} done: {} persisted, {} skipped, {} failed",
                category, persisted, skipped, failed
            );
            if *capped > 0 {
                line.push_str(&format!(", {} left for a later run", capped));
            }
            line
        }
    }
}

pub fn json_event(event: &ProgressEvent) -> Value {
    match event {
        ProgressEvent::Listed { category, files } => json!({
            "event": "listed",
            "category": category,
            "files": files
        }),
        ProgressEvent::Document {
            category,
            n,
            listed,
            path,
            outcome,
        } => json!({
            "event": "document",
            "category": category,
            "n": n,
            "listed": listed,
            "path": path,
            "outcome": outcome
        }),
        ProgressEvent::CategoryDone {
            category,
            persisted,
            skipped,
            failed,
            capped,
            error,
        } => json!({
            "event": "category_done",
            "category": category,
            "persisted": persisted,
            "skipped": skipped,
            "failed": failed,
            "capped": capped,
            "error": error
        }),
    }
}

pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", human_line(&event));
        let _ = stderr.flush();
    }
}

/// One JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", json_event(&event));
        let _ = stderr.flush();
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
