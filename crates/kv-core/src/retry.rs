//! Bounded exponential backoff for remote calls.

use backoff::ExponentialBackoffBuilder;
use std::time::Duration;
use tracing::{error, warn};

use crate::config::RetryConfig;
use crate::error::{VaultError, VaultResult};

/// How transient remote failures are retried.
///
/// A call is attempted at most `max_attempts` times and never retried once
/// `max_elapsed` has passed since the first attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_interval: Duration::from_millis(config.initial_interval_ms),
            multiplier: config.multiplier,
            max_interval: Duration::from_millis(config.max_interval_ms),
            max_elapsed: Duration::from_millis(config.max_elapsed_ms),
            max_attempts: config.max_attempts,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Run `op`, retrying while it fails with a transient error.
    pub fn run<T, F>(&self, desc: &str, mut op: F) -> VaultResult<T>
    where
        F: FnMut() -> VaultResult<T>,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_multiplier(self.multiplier)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build();

        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        let operation = || {
            attempt += 1;
            op().map_err(|err| {
                if err.is_transient() && attempt < max_attempts {
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                }
            })
        };
        let notify = |err: VaultError, next: Duration| {
            warn!(
                "{} failed, retrying in {} ms: {}",
                desc,
                next.as_millis(),
                err
            );
        };

        backoff::retry_notify(policy, operation, notify).map_err(|err| {
            let err = match err {
                backoff::Error::Permanent(err) => err,
                backoff::Error::Transient { err, .. } => err,
            };
            if err.is_transient() {
                error!("{} failed, retries exhausted: {}", desc, err);
            }
            err
        })
    }
}
