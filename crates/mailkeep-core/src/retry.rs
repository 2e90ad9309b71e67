//! Retry policy for remote operations
//!
//! Connection faults (reset, abort, server BYE) are always retried after a
//! reconnect. A command the server answered with NO or BAD is retried with
//! exponential backoff, up to a fixed number of attempts.

use crate::sync::Interrupt;
use crate::{CoreError, CoreResult};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use mailkeep_imap::ImapError;
use std::time::Duration;

/// Attempts per operation before a failing command is fatal
pub const MAX_ATTEMPTS: u32 = 7;

/// Backoff timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Wait after the first failure; doubles with every further one
    pub initial_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            initial_interval: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            // attempts are capped by count, not by interval or elapsed time
            max_interval: Duration::from_secs(24 * 60 * 60),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// What to do about a failed remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Connection is gone: reconnect and reissue, no attempt counted
    Reconnect,
    /// Wait, then reconnect and reissue
    Backoff { attempt: u32, wait: Duration },
    GiveUp,
}

/// Tracks failures of one logical operation
pub struct RetryController {
    max_attempts: u32,
    backoff: ExponentialBackoff,
    failures: u32,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            backoff: policy.backoff(),
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn on_failure(&mut self, error: &ImapError) -> RetryDecision {
        if error.is_transient() {
            return RetryDecision::Reconnect;
        }
        if !error.is_command_failure() {
            return RetryDecision::GiveUp;
        }

        self.failures += 1;
        if self.failures >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        match self.backoff.next_backoff() {
            Some(wait) => RetryDecision::Backoff {
                attempt: self.failures,
                wait,
            },
            None => RetryDecision::GiveUp,
        }
    }
}

/// Sleep for `wait` unless interrupted first
pub async fn pause(wait: Duration, interrupt: &Interrupt) -> CoreResult<()> {
    tokio::select! {
        _ = tokio::time::sleep(wait) => Ok(()),
        _ = interrupt.triggered() => Err(CoreError::Interrupted),
    }
}
