// src/retry/strategy.rs

use crate::config::RetryConfig;
use std::time::Duration;

/// Per-request dispatch counters, threaded explicitly through the dispatch
/// loop. Both counters start at 1: the first forward is retry 1 of attempt 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchState {
    /// Full routing attempts so far (a new attempt starts after a backend is
    /// demoted).
    pub attempts: u32,
    /// Forwards to the current backend within this attempt.
    pub retries: u32,
}

impl DispatchState {
    pub fn new() -> Self {
        Self {
            attempts: 1,
            retries: 1,
        }
    }

    /// One more forward to the same backend.
    pub fn retried(self) -> Self {
        Self {
            retries: self.retries + 1,
            ..self
        }
    }

    /// Move on to a different backend: bump the attempt, reset the
    /// same-backend retry budget.
    pub fn escalated(self) -> Self {
        Self {
            attempts: self.attempts + 1,
            retries: 1,
        }
    }
}

impl Default for DispatchState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Terminal check. Strictly greater-than: attempt `max_attempts` itself
    /// still runs.
    pub fn attempts_exhausted(&self, state: DispatchState) -> bool {
        state.attempts > self.config.max_attempts
    }

    /// Strictly less-than: the forward that observed the error already
    /// consumed retry `state.retries`.
    pub fn should_retry(&self, state: DispatchState) -> bool {
        state.retries < self.config.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.config.retry_delay()
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }
}
