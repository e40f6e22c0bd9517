//! Remote compute-session lifecycle (Livy-style `sparkSessions` API).
//!
//! ```text
//! create ─▶ starting ─▶ idle ─▶ submit ─▶ busy ─▶ idle ─▶ stop
//!              │                              │
//!              └──────── dead / error ◀───────┘
//! ```
//!
//! Waiting for readiness and for statement completion goes through the
//! shared poller ([`crate::poll`]): fixed interval, ceiling of
//! `ceil(timeout / interval)` attempts, unknown states treated as pending.
//!
//! [`ComputeSessionManager::run_statement`] is the only entry point the CLI
//! uses. It owns the session for the whole unit of work and calls
//! [`ComputeSessionManager::stop_session`] exactly once on every exit path.

use anyhow::{bail, Context};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::auth::{Audience, TokenProvider};
use crate::config::ComputeConfig;
use crate::poll::{poll_until, Observation, PollError, PollPolicy, Sleeper, TokioSleeper};
use crate::store::encode_segment;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The workspace has no compute capability provisioned; callers skip.
    #[error("compute sessions unavailable: {0}")]
    Unavailable(String),

    /// A terminal failure state or a statement error payload.
    #[error("{0}")]
    Failed(String),

    #[error("{0}")]
    TimedOut(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<PollError> for SessionError {
    fn from(err: PollError) -> Self {
        if err.is_timeout() {
            SessionError::TimedOut(err.to_string())
        } else {
            SessionError::Failed(err.to_string())
        }
    }
}

/// A created session. Never reused across invocations.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeSession {
    pub id: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub session_id: String,
    pub id: String,
}

/// Output of a statement that reached `available` without error.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementOutput {
    /// The `text/plain` rendering, when present.
    pub text: Option<String>,
    pub raw: Value,
}

pub struct ComputeSessionManager {
    client: reqwest::Client,
    endpoint: String,
    config: ComputeConfig,
    tokens: Arc<dyn TokenProvider>,
    sleeper: Arc<dyn Sleeper>,
}

impl ComputeSessionManager {
    pub fn new(
        config: &ComputeConfig,
        endpoint: &str,
        tokens: Arc<dyn TokenProvider>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            config: config.clone(),
            tokens,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval_secs)
    }

    pub fn readiness_policy(&self) -> PollPolicy {
        PollPolicy::from_timeout(
            Duration::from_secs(self.config.session_timeout_secs),
            self.interval(),
        )
    }

    pub fn completion_policy(&self) -> PollPolicy {
        PollPolicy::from_timeout(
            Duration::from_secs(self.config.statement_timeout_secs),
            self.interval(),
        )
    }

    fn sessions_url(&self) -> String {
        format!("{}/sparkSessions", self.endpoint)
    }

    fn session_url(&self, session_id: &str) -> String {
        format!("{}/{}", self.sessions_url(), encode_segment(session_id))
    }

    fn statement_url(&self, statement: &Statement) -> String {
        format!(
            "{}/statements/{}",
            self.session_url(&statement.session_id),
            encode_segment(&statement.id)
        )
    }

    async fn token(&self) -> anyhow::Result<String> {
        self.tokens.token(Audience::Compute).await
    }

    async fn get_json(&self, url: &str) -> anyhow::Result<Value> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(self.token().await?)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("GET {} returned HTTP {}: {}", url, status, truncate(&body));
        }
        Ok(resp.json().await.context("Invalid JSON response")?)
    }

    pub async fn create_session(&self) -> Result<ComputeSession, SessionError> {
        let body = json!({
            "name": self.config.session_name,
            "kind": "pyspark",
            "driverMemory": self.config.driver_memory,
            "driverCores": self.config.driver_cores,
            "executorMemory": self.config.executor_memory,
            "executorCores": self.config.executor_cores,
            "numExecutors": self.config.num_executors,
        });
        let resp = self
            .client
            .post(self.sessions_url())
            .bearer_auth(self.token().await?)
            .json(&body)
            .send()
            .await
            .context("Failed to create compute session")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = format!("HTTP {}: {}", status, truncate(&text));
            if is_unavailable(status.as_u16(), &text) {
                return Err(SessionError::Unavailable(message));
            }
            return Err(SessionError::Other(anyhow::anyhow!(
                "Session creation failed ({})",
                message
            )));
        }

        let json: Value = resp.json().await.context("Invalid session response")?;
        let id = id_string(json.get("id"))
            .ok_or_else(|| anyhow::anyhow!("Session response has no id"))?;
        let state = json
            .get("state")
            .and_then(Value::as_str)
            .unwrap_or("starting")
            .to_string();
        tracing::info!(session = %id, state = %state, "compute session created");
        Ok(ComputeSession { id, state })
    }

    pub async fn wait_until_idle(
        &self,
        session: &ComputeSession,
        policy: &PollPolicy,
    ) -> Result<(), SessionError> {
        let url = self.session_url(&session.id);
        let url = url.as_str();
        let what = format!("session {}", session.id);
        poll_until(&what, policy, self.sleeper.as_ref(), move || async move {
            let json = self.get_json(url).await?;
            Ok::<_, anyhow::Error>(interpret_session(&json))
        })
        .await?;
        tracing::info!(session = %session.id, "compute session idle");
        Ok(())
    }

    pub async fn submit_statement(
        &self,
        session: &ComputeSession,
        code: &str,
    ) -> Result<Statement, SessionError> {
        let url = format!("{}/statements", self.session_url(&session.id));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(self.token().await?)
            .json(&json!({ "code": code, "kind": "pyspark" }))
            .send()
            .await
            .context("Failed to submit statement")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SessionError::Other(anyhow::anyhow!(
                "Statement submit failed (HTTP {}): {}",
                status,
                truncate(&body)
            )));
        }
        let json: Value = resp.json().await.context("Invalid statement response")?;
        let id = id_string(json.get("id"))
            .ok_or_else(|| anyhow::anyhow!("Statement response has no id"))?;
        tracing::info!(session = %session.id, statement = %id, "statement submitted");
        Ok(Statement {
            session_id: session.id.clone(),
            id,
        })
    }

    pub async fn wait_until_complete(
        &self,
        statement: &Statement,
        policy: &PollPolicy,
    ) -> Result<StatementOutput, SessionError> {
        let url = self.statement_url(statement);
        let url = url.as_str();
        let what = format!("statement {} in session {}", statement.id, statement.session_id);
        let output = poll_until(&what, policy, self.sleeper.as_ref(), move || async move {
            let json = self.get_json(url).await?;
            Ok::<_, anyhow::Error>(interpret_statement(&json))
        })
        .await?;
        Ok(output)
    }

    pub async fn stop_session(&self, session: &ComputeSession) -> anyhow::Result<()> {
        let resp = self
            .client
            .delete(self.session_url(&session.id))
            .bearer_auth(self.token().await?)
            .send()
            .await
            .context("Failed to stop compute session")?;
        let status = resp.status();
        // Already gone is as good as stopped.
        if !status.is_success() && status.as_u16() != 404 {
            let body = resp.text().await.unwrap_or_default();
            bail!("Session stop failed (HTTP {}): {}", status, truncate(&body));
        }
        tracing::info!(session = %session.id, "compute session stopped");
        Ok(())
    }

    /// Create a session, run `code` on it, and tear the session down.
    ///
    /// Teardown runs exactly once whatever happens after creation; a
    /// teardown failure is logged and never replaces the primary error.
    pub async fn run_statement(&self, code: &str) -> Result<StatementOutput, SessionError> {
        let session = self.create_session().await?;
        let result = self.execute(&session, code).await;
        if let Err(e) = self.stop_session(&session).await {
            tracing::warn!(session = %session.id, error = %format!("{:#}", e), "session teardown failed");
        }
        result
    }

    async fn execute(
        &self,
        session: &ComputeSession,
        code: &str,
    ) -> Result<StatementOutput, SessionError> {
        self.wait_until_idle(session, &self.readiness_policy())
            .await?;
        let statement = self.submit_statement(session, code).await?;
        self.wait_until_complete(&statement, &self.completion_policy())
            .await
    }
}

/// Session poll body → observation. Only `idle` is ready.
pub fn interpret_session(json: &Value) -> Observation<()> {
    let state = json
        .get("state")
        .and_then(Value::as_str)
        .unwrap_or("missing");
    match state {
        "idle" => Observation::Ready(()),
        "dead" | "error" | "killed" | "cancelled" | "success" | "shutting_down" => {
            Observation::Failed(format!("session entered state '{}'", state))
        }
        other => Observation::Pending(other.to_string()),
    }
}

/// Statement poll body → observation.
///
/// `available` with `output.status == "error"` is a failure carrying the
/// remote `ename: evalue`.
pub fn interpret_statement(json: &Value) -> Observation<StatementOutput> {
    let state = json
        .get("state")
        .and_then(Value::as_str)
        .unwrap_or("missing");
    match state {
        "available" => {
            let output = json.get("output").cloned().unwrap_or(Value::Null);
            if output.get("status").and_then(Value::as_str) == Some("error") {
                let ename = output
                    .get("ename")
                    .and_then(Value::as_str)
                    .unwrap_or("Error");
                let evalue = output
                    .get("evalue")
                    .and_then(Value::as_str)
                    .unwrap_or("statement failed");
                return Observation::Failed(format!("{}: {}", ename, evalue));
            }
            let text = output
                .get("data")
                .and_then(|d| d.get("text/plain"))
                .and_then(Value::as_str)
                .map(str::to_string);
            Observation::Ready(StatementOutput { text, raw: output })
        }
        "error" | "cancelled" | "cancelling" => {
            Observation::Failed(format!("statement entered state '{}'", state))
        }
        other => Observation::Pending(other.to_string()),
    }
}

fn is_unavailable(status: u16, body: &str) -> bool {
    if status == 404 || status == 501 {
        return true;
    }
    let lower = body.to_ascii_lowercase();
    lower.contains("not provisioned") || lower.contains("notprovisioned")
}

fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(500).collect()
}
