//! Admission control for backend reads.
//!
//! A [`Limiter`] bounds how many reads may be in flight against one backend,
//! independently of how many chunk workers are running. Acquisition never
//! blocks: a saturated limiter refuses, and the retry layer decides how long
//! to keep asking. Each acquired slot is wrapped in a [`LimiterPermit`] that
//! reports the outcome of the read back to the limiter exactly once, on drop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::{LimiterConfig, LimiterKind};

/// How a read that held a permit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The read completed.
    Success,
    /// The read failed in a way that suggests the backend is overloaded.
    Dropped,
    /// The read ended for a reason that says nothing about backend load.
    Ignore,
}

/// Admission-control capability for one backend.
pub trait Limiter: Send + Sync {
    /// Try to take a slot. Returns `false` when the limiter is saturated.
    fn try_acquire(&self) -> bool;

    /// Give a slot back, reporting how the read went.
    fn release(&self, outcome: Outcome);

    /// Current concurrency limit.
    fn limit(&self) -> usize;

    /// Slots currently taken.
    fn in_flight(&self) -> usize;

    /// Whether a new acquisition would be refused right now.
    fn is_saturated(&self) -> bool {
        self.in_flight() >= self.limit()
    }
}

/// A held limiter slot, released on drop.
pub struct LimiterPermit {
    limiter: Arc<dyn Limiter>,
    outcome: Outcome,
}

impl LimiterPermit {
    /// Try to take a slot from the limiter.
    pub fn try_acquire(limiter: &Arc<dyn Limiter>) -> Option<Self> {
        if limiter.try_acquire() {
            Some(Self {
                limiter: limiter.clone(),
                outcome: Outcome::Ignore,
            })
        } else {
            None
        }
    }

    /// Record the outcome reported when the permit is released.
    pub fn set_outcome(&mut self, outcome: Outcome) {
        self.outcome = outcome;
    }
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.limiter.release(self.outcome);
    }
}

/// Build a limiter from configuration.
pub fn from_config(config: &LimiterConfig) -> Arc<dyn Limiter> {
    match config.kind {
        LimiterKind::Fixed => Arc::new(FixedLimiter::new(config.limit)),
        LimiterKind::Aimd => Arc::new(AimdLimiter::new(
            config.limit,
            config.min_limit,
            config.max_limit,
            config.backoff_ratio,
        )),
    }
}

/// Limiter with a static cap.
pub struct FixedLimiter {
    limit: usize,
    in_flight: AtomicUsize,
}

impl FixedLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            in_flight: AtomicUsize::new(0),
        }
    }
}

impl Limiter for FixedLimiter {
    fn try_acquire(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self, _outcome: Outcome) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn limit(&self) -> usize {
        self.limit
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct AimdState {
    limit: usize,
    in_flight: usize,
}

/// Additive-increase / multiplicative-decrease limiter.
///
/// Successful reads grow the limit by one (only while at least half the
/// limit is in use, so an idle backend does not inflate it); dropped reads
/// multiply it by `backoff_ratio`.
pub struct AimdLimiter {
    state: Mutex<AimdState>,
    min_limit: usize,
    max_limit: usize,
    backoff_ratio: f64,
}

impl AimdLimiter {
    pub fn new(initial: usize, min_limit: usize, max_limit: usize, backoff_ratio: f64) -> Self {
        let min_limit = min_limit.max(1);
        let max_limit = max_limit.max(min_limit);
        Self {
            state: Mutex::new(AimdState {
                limit: initial.clamp(min_limit, max_limit),
                in_flight: 0,
            }),
            min_limit,
            max_limit,
            backoff_ratio: backoff_ratio.clamp(0.1, 1.0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AimdState> {
        // A poisoned lock only means a panic elsewhere; the counters are still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Limiter for AimdLimiter {
    fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        if state.in_flight < state.limit {
            state.in_flight += 1;
            true
        } else {
            false
        }
    }

    fn release(&self, outcome: Outcome) {
        let mut state = self.lock();
        let was_in_flight = state.in_flight;
        state.in_flight = state.in_flight.saturating_sub(1);
        match outcome {
            Outcome::Success => {
                if was_in_flight * 2 >= state.limit && state.limit < self.max_limit {
                    state.limit += 1;
                }
            }
            Outcome::Dropped => {
                let reduced = (state.limit as f64 * self.backoff_ratio).floor() as usize;
                let reduced = reduced.clamp(self.min_limit, self.max_limit);
                if reduced != state.limit {
                    debug!("AIMD limiter backing off: {} -> {}", state.limit, reduced);
                }
                state.limit = reduced;
            }
            Outcome::Ignore => {}
        }
    }

    fn limit(&self) -> usize {
        self.lock().limit
    }

    fn in_flight(&self) -> usize {
        self.lock().in_flight
    }
}
