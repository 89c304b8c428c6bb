// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policy
//!
//! Dialing the broker and establishing producer/consumer channels are retried
//! until they succeed. The policy decides how long to wait between attempts
//! and whether to give up; the cancellation token lets the owner stop a loop
//! that is sleeping or in the middle of an attempt.

use crate::errors::AmqpError;
use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Interval between attempts when nothing else is configured.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// How the delay grows between two attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Always wait the base interval.
    Fixed,
    /// Multiply the delay after each failure, never exceeding `max_interval`.
    Exponential { multiplier: f64, max_interval: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub(crate) interval: Duration,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::fixed(DEFAULT_RETRY_INTERVAL)
    }
}

impl RetryPolicy {
    /// Unbounded retries with a fixed interval.
    pub fn fixed(interval: Duration) -> Self {
        RetryPolicy {
            interval,
            max_attempts: None,
            backoff: Backoff::Fixed,
        }
    }

    /// Unbounded retries starting at `interval` and growing by `multiplier`.
    pub fn exponential(interval: Duration, multiplier: f64, max_interval: Duration) -> Self {
        RetryPolicy {
            interval,
            max_attempts: None,
            backoff: Backoff::Exponential {
                multiplier,
                max_interval,
            },
        }
    }

    /// Gives up after `attempts` failed attempts.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Base delay between two attempts.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Delay to wait after the `failures`-th consecutive failure.
    pub fn delay(&self, failures: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential {
                multiplier,
                max_interval,
            } => {
                let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
                let factor = multiplier.max(1.0).powi(exponent);
                let delay = self.interval.as_secs_f64() * factor;

                if !delay.is_finite() || delay >= max_interval.as_secs_f64() {
                    max_interval
                } else {
                    Duration::from_secs_f64(delay)
                }
            }
        }
    }

    fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}

/// Runs `attempt` until it succeeds.
///
/// Failures are logged and followed by the policy delay. The loop ends with
/// the last error once the policy gives up, or with `AmqpError::Cancelled` as
/// soon as `cancel` fires.
///
/// # Parameters
/// * `policy` - Delay and attempt cap
/// * `cancel` - Stops the loop before, during or between attempts
/// * `operation` - Name used in the logs
/// * `attempt` - Builds one attempt; called again after every failure
///
/// # Returns
/// The value of the first successful attempt
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut attempt: F,
) -> Result<T, AmqpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AmqpError>>,
{
    let mut failures = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(AmqpError::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AmqpError::Cancelled),
            result = attempt() => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        failures = failures.saturating_add(1);
        if policy.exhausted(failures) {
            error!(
                error = err.to_string(),
                operation, failures, "giving up after too many attempts"
            );
            return Err(err);
        }

        let delay = policy.delay(failures);
        warn!(
            error = err.to_string(),
            operation,
            failures,
            delay_ms = delay.as_millis() as u64,
            "attempt failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AmqpError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
