//! Document-analysis client (long-running operation protocol).
//!
//! Submitting a document does not return the result. The service answers
//! `202 Accepted` with an `operation-location` header, and that URL is
//! polled until the operation settles:
//!
//! ```text
//! POST {endpoint}/{models_path}/{model}:analyze?api-version={v}   (raw bytes)
//!   └─▶ 202, operation-location: {op}
//! GET {op}  ─▶ {"status": "notStarted" | "running" | "succeeded" | "failed", ...}
//! ```
//!
//! Polling goes through [`crate::poll`]: fixed interval (3 s by default),
//! bounded attempts (40 by default). Unknown statuses and failed poll
//! requests count as still pending.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{Audience, TokenProvider};
use crate::config::AnalysisConfig;
use crate::models::AnalysisResult;
use crate::poll::{poll_until, Observation, PollPolicy, Sleeper, TokioSleeper};
use crate::store::encode_segment;

/// Anything that can turn document bytes into an [`AnalysisResult`].
#[async_trait]
pub trait DocumentAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        model_id: &str,
        content: &[u8],
        content_type: &str,
    ) -> Result<AnalysisResult>;
}

pub struct AnalysisClient {
    client: reqwest::Client,
    endpoint: String,
    models_path: String,
    api_version: String,
    policy: PollPolicy,
    tokens: Arc<dyn TokenProvider>,
    sleeper: Arc<dyn Sleeper>,
}

impl AnalysisClient {
    pub fn new(
        config: &AnalysisConfig,
        endpoint: &str,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            models_path: config.models_path.trim_matches('/').to_string(),
            api_version: config.api_version.clone(),
            policy: PollPolicy::new(
                Duration::from_secs(config.poll_interval_secs),
                config.max_poll_attempts,
            ),
            tokens,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    fn analyze_url(&self, model_id: &str) -> String {
        let models = if self.models_path.is_empty() {
            String::new()
        } else {
            format!("{}/", self.models_path)
        };
        format!(
            "{}/{}{}:analyze",
            self.endpoint,
            models,
            encode_segment(model_id)
        )
    }

    /// Submit the document; returns the operation URL to poll.
    async fn submit(&self, model_id: &str, content: &[u8], content_type: &str) -> Result<String> {
        let token = self.tokens.token(Audience::DocumentAnalysis).await?;
        let resp = self
            .client
            .post(self.analyze_url(model_id))
            .query(&[("api-version", self.api_version.as_str())])
            .bearer_auth(token)
            .header("Content-Type", content_type)
            .body(content.to_vec())
            .send()
            .await
            .with_context(|| format!("Failed to submit document to model '{}'", model_id))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "Analysis submit failed (HTTP {}): {}",
                status,
                body.chars().take(500).collect::<String>()
            );
        }

        resp.headers()
            .get("operation-location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Analysis response has no operation-location header"))
    }

    async fn poll_operation(&self, location: &str) -> Result<Observation<Value>> {
        let token = self.tokens.token(Audience::DocumentAnalysis).await?;
        let resp = self
            .client
            .get(location)
            .bearer_auth(token)
            .send()
            .await
            .context("Analysis poll request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "Analysis poll failed (HTTP {}): {}",
                status,
                body.chars().take(200).collect::<String>()
            );
        }

        let json: Value = resp.json().await.context("Invalid analysis poll response")?;
        Ok(interpret_operation(json))
    }
}

#[async_trait]
impl DocumentAnalyzer for AnalysisClient {
    async fn analyze(
        &self,
        model_id: &str,
        content: &[u8],
        content_type: &str,
    ) -> Result<AnalysisResult> {
        let location = self.submit(model_id, content, content_type).await?;
        tracing::debug!(model_id, operation = %location, "analysis submitted");

        let location = location.as_str();
        let what = format!("analysis with model '{}'", model_id);
        let raw = poll_until(&what, &self.policy, self.sleeper.as_ref(), move || {
            self.poll_operation(location)
        })
        .await?;

        Ok(AnalysisResult {
            model_id: model_id.to_string(),
            api_version: self.api_version.clone(),
            raw,
        })
    }
}

/// Classify one poll response body.
///
/// Only `succeeded` is success; `failed` and `canceled` are terminal
/// failures; anything else (including a missing status) is pending.
pub fn interpret_operation(json: Value) -> Observation<Value> {
    let status = json
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("missing")
        .to_string();

    match status.to_ascii_lowercase().as_str() {
        "succeeded" => Observation::Ready(json),
        "failed" | "canceled" | "cancelled" => {
            let message = json
                .get("error")
                .and_then(|e| {
                    e.get("message").and_then(Value::as_str).map(|m| {
                        match e.get("code").and_then(Value::as_str) {
                            Some(code) => format!("{}: {}", code, m),
                            None => m.to_string(),
                        }
                    })
                })
                .unwrap_or_else(|| format!("analysis ended with status '{}'", status));
            Observation::Failed(message)
        }
        _ => Observation::Pending(status),
    }
}
