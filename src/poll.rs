//! Fixed-interval polling
//!
//! Every wait in the runner (changeset creation, stack completion, stack
//! deletion, cluster state, step state) goes through [`poll_until`]. The
//! caller supplies a status classifier that turns one observation into
//! [`PollResult::Done`], [`PollResult::Retry`] or [`PollResult::Fail`].
//!
//! Transport errors returned by the classifier are logged and retried.
//! Other errors abort the poll. A bounded poll that runs out of attempts
//! fails with [`RunnerError::PollExhausted`], and cancelling the token
//! aborts the poll before the next attempt.

use crate::error::{Result, RunnerError};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of a single status check
#[derive(Debug)]
pub enum PollResult<T> {
    /// Target state reached
    Done(T),
    /// Not there yet, check again after the interval
    Retry,
    /// Terminal failure, stop polling
    Fail(RunnerError),
}

/// Delay and attempt budget for one kind of wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Fixed delay between attempts
    pub interval: Duration,
    /// `None` polls until done, failed or cancelled
    pub max_attempts: Option<u32>,
    /// Log a progress line every N retries (`None` logs retries at debug only)
    pub progress_every: Option<u32>,
}

impl PollPolicy {
    /// Poll at most `max_attempts` times
    pub fn bounded(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts),
            progress_every: None,
        }
    }

    /// Poll until done, failed or cancelled
    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            progress_every: None,
        }
    }

    /// Log progress every `n` attempts
    pub fn with_progress_every(mut self, n: u32) -> Self {
        self.progress_every = Some(n.max(1));
        self
    }
}

/// Poll timings for every wait the runner performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Changeset creation
    pub change_set: PollPolicy,
    /// Stack create/update completion
    pub stack: PollPolicy,
    /// Stack deletion
    pub stack_delete: PollPolicy,
    /// Cluster state
    pub cluster: PollPolicy,
    /// Step state
    pub step: PollPolicy,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            change_set: PollPolicy::bounded(Duration::from_secs(5), 120),
            stack: PollPolicy::bounded(Duration::from_secs(5), 720),
            stack_delete: PollPolicy::unbounded(Duration::from_secs(2)),
            cluster: PollPolicy::bounded(Duration::from_secs(10), 10_000),
            step: PollPolicy::unbounded(Duration::from_secs(5)).with_progress_every(10),
        }
    }
}

impl PollSettings {
    /// Same policy for every wait, used by tests
    pub fn uniform(policy: PollPolicy) -> Self {
        Self {
            change_set: policy,
            stack: policy,
            stack_delete: policy,
            cluster: policy,
            step: policy,
        }
    }
}

/// Poll `check` until it reports done or failure.
///
/// `check` receives the 1-based attempt number. `what` names the target in
/// logs and errors.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    policy: PollPolicy,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollResult<T>>>,
{
    let mut attempt: u32 = 0;
    let mut warned = false;

    loop {
        if cancel.is_cancelled() {
            return Err(RunnerError::Cancelled(what.to_string()));
        }

        attempt += 1;

        match check(attempt).await {
            Ok(PollResult::Done(value)) => return Ok(value),
            Ok(PollResult::Fail(err)) => return Err(err),
            Ok(PollResult::Retry) => match policy.progress_every {
                Some(n) if attempt % n == 0 => {
                    info!(what = %what, attempt, "Still waiting");
                }
                _ => debug!(what = %what, attempt, "Not ready, retrying"),
            },
            Err(err) if err.is_transient() => {
                if warned {
                    debug!(what = %what, attempt, error = %err, "Status check failed, retrying");
                } else {
                    warn!(what = %what, attempt, error = %err, "Status check failed, retrying");
                    warned = true;
                }
            }
            Err(err) => return Err(err),
        }

        if let Some(max) = policy.max_attempts {
            if attempt >= max {
                return Err(RunnerError::PollExhausted {
                    what: what.to_string(),
                    attempts: attempt,
                });
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RunnerError::Cancelled(what.to_string()));
            }
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
}
