//! Object-store abstraction for the lake.
//!
//! The [`ObjectStore`] trait covers the handful of hierarchical-filesystem
//! operations the pipeline needs. [`dfs::DfsStore`] speaks the DFS HTTP
//! protocol; [`memory::MemoryStore`] keeps everything in process for tests.
//!
//! Paths are store-relative and `/`-separated (`Files/raw/invoices/a.pdf`).
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod dfs;
pub mod memory;

pub use dfs::DfsStore;
pub use memory::MemoryStore;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Failure reported by the remote store with an HTTP status.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{op} failed for '{path}' (HTTP {status}): {body}")]
    Status {
        op: &'static str,
        path: String,
        status: u16,
        body: String,
    },
    #[error("'{0}' not found")]
    NotFound(String),
}

impl StoreError {
    pub fn status(&self) -> Option<u16> {
        match self {
            StoreError::Status { status, .. } => Some(*status),
            StoreError::NotFound(_) => Some(404),
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create a directory. Succeeds if it already exists.
    async fn ensure_directory(&self, path: &str) -> Result<()>;

    /// `false` only for "not found"; any other failure is an error.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Files (never directories) under `directory`, recursively, sorted.
    async fn list_files(&self, directory: &str) -> Result<Vec<String>>;

    async fn download(&self, path: &str) -> Result<Vec<u8>>;

    /// Create the file if absent, append the payload at offset 0, then
    /// flush at the payload length.
    async fn upload_bytes(&self, path: &str, bytes: &[u8]) -> Result<()>;

    /// Remove a file. Succeeds if it does not exist.
    async fn delete(&self, path: &str) -> Result<()>;
}

/// Serialize `value` as pretty JSON and upload it in one two-phase write.
pub async fn upload_json<T: Serialize + Sync>(
    store: &dyn ObjectStore,
    path: &str,
    value: &T,
) -> Result<()> {
    let payload = serde_json::to_vec_pretty(value)
        .with_context(|| format!("Failed to serialize JSON for {}", path))?;
    store.upload_bytes(path, &payload).await
}

/// Download and parse a JSON artifact.
pub async fn download_json<T: serde::de::DeserializeOwned>(
    store: &dyn ObjectStore,
    path: &str,
) -> Result<T> {
    let bytes = store.download(path).await?;
    serde_json::from_slice(&bytes).with_context(|| format!("Invalid JSON in {}", path))
}

/// Percent-encode one path segment (RFC 3986 unreserved set kept as is).
pub fn encode_segment(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

/// Encode every segment of a `/`-separated path, dropping empty segments.
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(encode_segment)
        .collect::<Vec<_>>()
        .join("/")
}
