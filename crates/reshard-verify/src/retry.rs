//! Retrying accessor for backend reads.
//!
//! Every read the engine issues (key probes during chunking, range reads
//! during diffing) runs through [`retry`], which takes an admission permit
//! from the backend's limiter, bounds the attempt with a timeout, and retries
//! transient failures with exponential backoff.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, VerifyError};
use crate::limiter::{Limiter, LimiterPermit, Outcome};
use crate::metrics::{MetricsCollector, NoopMetrics};

/// Longest sleep between two permit acquisition attempts.
const ACQUIRE_POLL_MAX: Duration = Duration::from_millis(50);

/// How reads against one backend are admitted, bounded and retried.
#[derive(Clone)]
pub struct RetryOptions {
    /// Admission limiter shared by every reader of this backend.
    pub limiter: Arc<dyn Limiter>,

    /// Label for metrics and logs ("source" or "target").
    pub backend: String,

    pub metrics: Arc<dyn MetricsCollector>,

    /// Attempts after the first one.
    pub max_retries: usize,

    /// Deadline for a single attempt.
    pub timeout: Duration,

    /// Maximum wait for a limiter permit per attempt.
    pub acquire_timeout: Duration,

    /// Delay before the first retry; doubles per attempt.
    pub base_delay: Duration,

    /// Upper bound on the retry delay.
    pub max_delay: Duration,
}

impl RetryOptions {
    /// Options with default tunables for the given backend.
    pub fn new(backend: impl Into<String>, limiter: Arc<dyn Limiter>) -> Self {
        Self {
            limiter,
            backend: backend.into(),
            metrics: Arc::new(NoopMetrics),
            max_retries: 10,
            timeout: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(60),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(20) as u32;
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("backend", &self.backend)
            .field("limit", &self.limiter.limit())
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

/// Run `f` against the backend described by `options`.
///
/// Transient errors are retried up to `max_retries` more times; permanent
/// errors and cancellation return immediately. When all attempts fail the
/// last error is wrapped in [`VerifyError::RetriesExhausted`].
pub async fn retry<T, F, Fut>(
    options: &RetryOptions,
    cancel: &CancellationToken,
    operation: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match attempt_once(options, cancel, operation, &mut f).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_cancelled() || !e.is_transient() => return Err(e),
            Err(e) if attempt > options.max_retries => {
                warn!(
                    "{} on {} failed after {} attempts: {}",
                    operation, options.backend, attempt, e
                );
                return Err(VerifyError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: Box::new(e),
                });
            }
            Err(e) => {
                options.metrics.retry(&options.backend);
                let delay = options.backoff(attempt);
                debug!(
                    "{} on {} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation,
                    options.backend,
                    attempt,
                    options.max_retries + 1,
                    delay,
                    e
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(VerifyError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn attempt_once<T, F, Fut>(
    options: &RetryOptions,
    cancel: &CancellationToken,
    operation: &str,
    f: &mut F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut permit = acquire(options, cancel).await?;

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(VerifyError::Cancelled),
        r = tokio::time::timeout(options.timeout, f()) => match r {
            Ok(r) => r,
            Err(_) => Err(VerifyError::Timeout {
                operation: format!("{} on {}", operation, options.backend),
                timeout: options.timeout,
            }),
        },
    };

    permit.set_outcome(match &result {
        Ok(_) => Outcome::Success,
        Err(e) if e.is_transient() => Outcome::Dropped,
        Err(_) => Outcome::Ignore,
    });
    result
}

/// Poll the limiter until a permit is available, the acquisition wait runs
/// out, or the run is cancelled.
async fn acquire(options: &RetryOptions, cancel: &CancellationToken) -> Result<LimiterPermit> {
    let started = Instant::now();
    let mut poll = Duration::from_millis(1);
    loop {
        if let Some(permit) = LimiterPermit::try_acquire(&options.limiter) {
            options
                .metrics
                .limiter_wait(&options.backend, started.elapsed());
            return Ok(permit);
        }

        let waited = started.elapsed();
        if waited >= options.acquire_timeout {
            options.metrics.limiter_wait(&options.backend, waited);
            return Err(VerifyError::LimiterSaturated {
                backend: options.backend.clone(),
                waited,
            });
        }

        let sleep_for = poll.min(options.acquire_timeout - waited);
        tokio::select! {
            _ = cancel.cancelled() => return Err(VerifyError::Cancelled),
            _ = tokio::time::sleep(sleep_for) => {}
        }
        poll = (poll * 2).min(ACQUIRE_POLL_MAX);
    }
}
