//! Hierarchical-filesystem client over HTTP (ADLS Gen2 / OneLake DFS).
//!
//! Talks to `{endpoint}/{workspace}` with bearer tokens from a
//! [`TokenProvider`]. Every store-relative path is prefixed with the item
//! (container) id and segment-encoded before it is placed in a URL.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | `ensure_directory` | `PUT {base}/{item}/{path}?resource=directory` (409 ok) |
//! | create file | `PUT {base}/{item}/{path}?resource=file` (409 ok) |
//! | append | `PATCH {base}/{item}/{path}?action=append&position=0` |
//! | flush | `PATCH {base}/{item}/{path}?action=flush&position={len}` |
//! | `list_files` | `GET {base}?resource=filesystem&directory={item}/{dir}&recursive=true` |
//! | `exists` | `HEAD {base}/{item}/{path}` |
//! | `download` | `GET {base}/{item}/{path}` |
//! | `delete` | `DELETE {base}/{item}/{path}` (404 ok) |
//!
//! Large listings are followed through the `x-ms-continuation` header.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use super::{encode_path, ObjectStore, StoreError};
use crate::auth::{Audience, TokenProvider};
use crate::config::{join_path, StorageConfig};

const CONTINUATION_HEADER: &str = "x-ms-continuation";

pub struct DfsStore {
    client: reqwest::Client,
    /// `{endpoint}/{workspace}` without a trailing slash.
    base_url: String,
    item: String,
    api_version: String,
    tokens: Arc<dyn TokenProvider>,
}

impl DfsStore {
    pub fn new(
        config: &StorageConfig,
        workspace_id: &str,
        item_id: &str,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: format!(
                "{}/{}",
                config.endpoint.trim_end_matches('/'),
                super::encode_segment(workspace_id)
            ),
            item: item_id.to_string(),
            api_version: config.api_version.clone(),
            tokens,
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url,
            encode_path(&join_path(&self.item, path))
        )
    }

    async fn request(&self, method: Method, url: &str) -> Result<reqwest::RequestBuilder> {
        let token = self.tokens.token(Audience::Storage).await?;
        Ok(self
            .client
            .request(method, url)
            .bearer_auth(token)
            .header("x-ms-version", &self.api_version))
    }

    async fn send(
        &self,
        op: &'static str,
        path: &str,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        builder
            .send()
            .await
            .with_context(|| format!("{} request failed for '{}'", op, path))
    }

    /// Create a directory or file, treating 409 Conflict as "already there".
    async fn create(&self, path: &str, resource: &'static str) -> Result<()> {
        let op = if resource == "directory" {
            "create directory"
        } else {
            "create file"
        };
        let builder = self
            .request(Method::PUT, &self.url(path))
            .await?
            .query(&[("resource", resource)])
            .header("Content-Length", "0");
        let resp = self.send(op, path, builder).await?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::CONFLICT {
            return Ok(());
        }
        Err(status_error(op, path, resp).await.into())
    }
}

async fn status_error(op: &'static str, path: &str, resp: reqwest::Response) -> StoreError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    StoreError::Status {
        op,
        path: path.to_string(),
        status,
        body: body.chars().take(500).collect(),
    }
}

#[async_trait]
impl ObjectStore for DfsStore {
    async fn ensure_directory(&self, path: &str) -> Result<()> {
        self.create(path, "directory").await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let builder = self.request(Method::HEAD, &self.url(path)).await?;
        let resp = self.send("exists", path, builder).await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(status_error("exists", path, resp).await.into()),
        }
    }

    async fn list_files(&self, directory: &str) -> Result<Vec<String>> {
        let item_prefix = format!("{}/", self.item.trim_matches('/'));
        let directory_param = join_path(&self.item, directory);
        let mut files = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut query = vec![
                ("resource", "filesystem".to_string()),
                ("directory", directory_param.clone()),
                ("recursive", "true".to_string()),
            ];
            if let Some(ref token) = continuation {
                query.push(("continuation", token.clone()));
            }

            let builder = self
                .request(Method::GET, &self.base_url)
                .await?
                .query(&query);
            let resp = self.send("list", directory, builder).await?;

            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }
            if !resp.status().is_success() {
                return Err(status_error("list", directory, resp).await.into());
            }

            continuation = resp
                .headers()
                .get(CONTINUATION_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string);

            let json: serde_json::Value = resp
                .json()
                .await
                .with_context(|| format!("Invalid listing response for '{}'", directory))?;
            for name in parse_listing(&json)? {
                let relative = name
                    .strip_prefix(&item_prefix)
                    .map(str::to_string)
                    .unwrap_or(name);
                files.push(relative);
            }

            if continuation.is_none() {
                break;
            }
        }

        files.sort();
        Ok(files)
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let builder = self.request(Method::GET, &self.url(path)).await?;
        let resp = self.send("download", path, builder).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(path.to_string()).into());
        }
        if !resp.status().is_success() {
            return Err(status_error("download", path, resp).await.into());
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn upload_bytes(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.create(path, "file").await?;

        let url = self.url(path);
        let append = self
            .request(Method::PATCH, &url)
            .await?
            .query(&[("action", "append"), ("position", "0")])
            .header("Content-Type", "application/octet-stream")
            .body(bytes.to_vec());
        let resp = self.send("append", path, append).await?;
        if !resp.status().is_success() {
            return Err(status_error("append", path, resp).await.into());
        }

        let length = bytes.len().to_string();
        let flush = self
            .request(Method::PATCH, &url)
            .await?
            .query(&[("action", "flush"), ("position", length.as_str())])
            .header("Content-Length", "0");
        let resp = self.send("flush", path, flush).await?;
        if !resp.status().is_success() {
            return Err(status_error("flush", path, resp).await.into());
        }

        tracing::debug!(path, bytes = bytes.len(), "uploaded");
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let builder = self.request(Method::DELETE, &self.url(path)).await?;
        let resp = self.send("delete", path, builder).await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(status_error("delete", path, resp).await.into()),
        }
    }
}

/// Names of file entries in a `resource=filesystem` listing.
///
/// `isDirectory` arrives as a string (`"true"`) from the service; a JSON
/// boolean is accepted as well.
fn parse_listing(json: &serde_json::Value) -> Result<Vec<String>> {
    let paths = match json.get("paths") {
        Some(p) => p
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid listing response: paths is not an array"))?,
        None => return Ok(Vec::new()),
    };

    let mut names = Vec::with_capacity(paths.len());
    for entry in paths {
        let is_directory = match entry.get("isDirectory") {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        };
        if is_directory {
            continue;
        }
        if let Some(name) = entry.get("name").and_then(|n| n.as_str()) {
            names.push(name.to_string());
        }
    }
    Ok(names)
}
