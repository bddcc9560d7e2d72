//! CI polling with bounded backoff.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capabilities::{CiProvider, PipelineRef, PipelineStatus};

/// Shortest delay between polls, whatever the config says.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Largest growth factor applied between polls.
pub const MAX_MULTIPLIER: f64 = 10.0;

/// Polling behaviour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CiWaitConfig {
    /// First delay between polls
    pub initial_interval: Duration,
    /// Delay ceiling
    pub max_interval: Duration,
    /// Growth factor applied after every poll
    pub multiplier: f64,
    /// Consecutive transient errors tolerated before giving up
    pub max_query_errors: u32,
}

impl Default for CiWaitConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(15),
            max_interval: Duration::from_secs(60),
            multiplier: 1.5,
            max_query_errors: 5,
        }
    }
}

impl CiWaitConfig {
    /// Growth factor clamped to `1.0..=MAX_MULTIPLIER`; non-finite values mean no growth.
    fn effective_multiplier(&self) -> f64 {
        if self.multiplier.is_finite() {
            self.multiplier.clamp(1.0, MAX_MULTIPLIER)
        } else {
            1.0
        }
    }
}

/// Result of waiting on a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CiOutcome {
    Passed,
    Failed,
    /// No terminal status before the deadline. Not a CI failure.
    Timeout,
    /// The provider could not be queried
    PollError(String),
    Cancelled,
}

impl CiOutcome {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Passed | Self::Failed)
    }
}

/// Polls a [`CiProvider`] until the pipeline settles.
#[derive(Clone)]
pub struct CiWaiter {
    ci: Arc<dyn CiProvider>,
    config: CiWaitConfig,
}

impl CiWaiter {
    pub fn new(ci: Arc<dyn CiProvider>, config: CiWaitConfig) -> Self {
        Self { ci, config }
    }

    /// Wait for `pipeline` to pass or fail.
    ///
    /// Never outlives `timeout`, and returns promptly once `cancel` fires,
    /// including while a query is in flight.
    pub async fn wait(
        &self,
        pipeline: &PipelineRef,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> CiOutcome {
        let deadline = Instant::now() + timeout;
        let max_interval = self.config.max_interval.max(MIN_POLL_INTERVAL);
        let multiplier = self.config.effective_multiplier();
        let mut interval = self.config.initial_interval.clamp(MIN_POLL_INTERVAL, max_interval);
        let mut consecutive_errors = 0;
        let mut polls = 0u32;

        loop {
            let query = tokio::select! {
                biased;
                () = cancel.cancelled() => return CiOutcome::Cancelled,
                () = sleep_until(deadline) => {
                    warn!(sha = %pipeline.commit_sha, polls, "CI wait timed out");
                    return CiOutcome::Timeout;
                }
                result = self.ci.query_status(pipeline) => result,
            };
            polls += 1;

            match query {
                Ok(PipelineStatus::Passed) => return CiOutcome::Passed,
                Ok(PipelineStatus::Failed) => return CiOutcome::Failed,
                Ok(PipelineStatus::Pending) => {
                    consecutive_errors = 0;
                    debug!(sha = %pipeline.commit_sha, polls, "Pipeline pending");
                }
                Err(e) if e.is_transient() => {
                    consecutive_errors += 1;
                    if consecutive_errors >= self.config.max_query_errors {
                        return CiOutcome::PollError(e.to_string());
                    }
                    warn!(
                        sha = %pipeline.commit_sha,
                        attempt = consecutive_errors,
                        error = %e,
                        "Transient CI query error, retrying"
                    );
                }
                Err(e) => return CiOutcome::PollError(e.to_string()),
            }

            let pause = interval.min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                biased;
                () = cancel.cancelled() => return CiOutcome::Cancelled,
                () = sleep(pause) => {}
            }
            interval = interval.mul_f64(multiplier).min(max_interval);
        }
    }
}
