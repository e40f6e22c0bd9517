//! In-memory [`ObjectStore`] for tests.
//!
//! Files and directories live in `BTreeMap`/`BTreeSet` behind
//! `std::sync::RwLock`. Operation counters let tests assert how often the
//! pipeline touched the store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use super::{ObjectStore, StoreError};

/// In-memory store keyed by store-relative path.
pub struct MemoryStore {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    directories: RwLock<BTreeSet<String>>,
    downloads: AtomicUsize,
    uploads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(BTreeMap::new()),
            directories: RwLock::new(BTreeSet::new()),
            downloads: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
        }
    }

    /// Seed a file without counting it as an upload.
    pub fn insert(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(normalize(path), bytes.into());
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&normalize(path))
            .cloned()
    }

    /// Every file path currently stored, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn has_directory(&self, path: &str) -> bool {
        self.directories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&normalize(path))
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn ensure_directory(&self, path: &str) -> Result<()> {
        self.directories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(normalize(path));
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let key = normalize(path);
        let is_file = self
            .files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&key);
        Ok(is_file || self.has_directory(&key))
    }

    async fn list_files(&self, directory: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", normalize(directory));
        Ok(self
            .files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.get(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()).into())
    }

    async fn upload_bytes(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.insert(path, bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&normalize(path));
        Ok(())
    }
}
