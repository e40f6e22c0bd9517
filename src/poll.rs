//! Bounded polling for long-running remote operations.
//!
//! Both the analysis service and the compute-session API hand back a
//! handle that has to be polled until it settles. The loop here is split
//! into a pure transition ([`step`]) over [`PollState`] and a small async
//! driver ([`poll_until`]) that sleeps through an injected [`Sleeper`], so
//! the whole protocol can be exercised without real delays.
//!
//! Two rules hold for every caller:
//!
//! - the attempt ceiling always terminates the loop;
//! - anything the caller cannot classify as success or failure is reported
//!   as [`Observation::Pending`] and keeps the loop going.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Interval and attempt ceiling for one poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Ceiling expressed as a wall-clock budget: `ceil(timeout / interval)` attempts.
    pub fn from_timeout(timeout: Duration, interval: Duration) -> Self {
        let interval_ms = interval.as_millis().max(1);
        let attempts = timeout.as_millis().div_ceil(interval_ms);
        Self::new(interval, u32::try_from(attempts).unwrap_or(u32::MAX))
    }

    /// Time spent sleeping when every attempt is used.
    pub fn ceiling(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// What one probe of the remote handle reported.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation<T> {
    /// Not settled yet; carries the remote state label for diagnostics.
    Pending(String),
    Ready(T),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollState {
    /// Probes made so far.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl PollState {
    pub fn start(policy: &PollPolicy) -> Self {
        Self {
            attempt: 0,
            max_attempts: policy.max_attempts,
        }
    }

    pub fn elapsed(&self, policy: &PollPolicy) -> Duration {
        policy.interval * self.attempt
    }
}

/// Result of feeding one observation into the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Step<T> {
    Wait(PollState),
    Done(T),
    Failed(String),
    Exhausted { attempts: u32 },
}

/// Advance the poll state machine by one observation.
pub fn step<T>(state: PollState, observation: Observation<T>) -> Step<T> {
    let attempt = state.attempt + 1;
    match observation {
        Observation::Ready(value) => Step::Done(value),
        Observation::Failed(message) => Step::Failed(message),
        Observation::Pending(_) if attempt >= state.max_attempts => {
            Step::Exhausted { attempts: attempt }
        }
        Observation::Pending(_) => Step::Wait(PollState { attempt, ..state }),
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("{what} failed: {message}")]
    Failed { what: String, message: String },

    #[error(
        "{what} timed out after {attempts} attempts ({waited:?}); last state: {last_state}{}",
        error_suffix(.last_error)
    )]
    TimedOut {
        what: String,
        attempts: u32,
        waited: Duration,
        last_state: String,
        last_error: Option<String>,
    },
}

fn error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|e| format!("; last error: {}", e))
        .unwrap_or_default()
}

impl PollError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PollError::TimedOut { .. })
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real sleeping on the tokio timer.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Drive `probe` until it settles or the policy's ceiling is reached.
///
/// Sleeps one interval before every probe. A probe that errors (network,
/// unexpected HTTP status) counts as a pending attempt; its message is kept
/// and reported if the loop times out.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    policy: &PollPolicy,
    sleeper: &dyn Sleeper,
    mut probe: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Observation<T>>>,
{
    let mut state = PollState::start(policy);
    let mut last_state = "unknown".to_string();
    let mut last_error: Option<String> = None;

    loop {
        sleeper.sleep(policy.interval).await;

        let observation = match probe().await {
            Ok(observation) => observation,
            Err(e) => {
                tracing::warn!(what, attempt = state.attempt + 1, error = %format!("{:#}", e), "poll request failed");
                last_error = Some(format!("{:#}", e));
                Observation::Pending(last_state.clone())
            }
        };
        if let Observation::Pending(ref label) = observation {
            last_state = label.clone();
        }

        match step(state, observation) {
            Step::Wait(next) => {
                tracing::debug!(what, attempt = next.attempt, state = %last_state, "still pending");
                state = next;
            }
            Step::Done(value) => return Ok(value),
            Step::Failed(message) => {
                return Err(PollError::Failed {
                    what: what.to_string(),
                    message,
                })
            }
            Step::Exhausted { attempts } => {
                return Err(PollError::TimedOut {
                    what: what.to_string(),
                    attempts,
                    waited: policy.interval * attempts,
                    last_state,
                    last_error,
                })
            }
        }
    }
}
