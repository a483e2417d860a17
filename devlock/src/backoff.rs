//! Deferral backoff policies.
//!
//! When a device lock cannot be taken the orchestrator leaves the message
//! unacknowledged and waits before reading it again. How long it waits is
//! decided here.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Decides how long to pause after a deferred job.
pub trait BackoffPolicy: Send + Sync + fmt::Debug {
    /// Delay before the deferred message is read again.
    ///
    /// `consecutive` counts deferrals in a row including this one, so it is
    /// always at least 1.
    fn deferral_delay(&self, consecutive: u32) -> Duration;
}

/// The same pause after every deferral.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(5);

    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DELAY)
    }
}

impl BackoffPolicy for FixedBackoff {
    fn deferral_delay(&self, _consecutive: u32) -> Duration {
        self.delay
    }
}

/// Configuration for exponential deferral backoff.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first deferral in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_backoff_ms: 60_000,
        }
    }
}

/// Computes the delay for the given number of consecutive deferrals.
///
/// Formula: delay = min(base_delay * 2^(consecutive - 1), max_backoff)
pub fn compute_backoff_delay(consecutive: u32, config: &BackoffConfig) -> Duration {
    if consecutive == 0 {
        return Duration::ZERO;
    }

    let exp = consecutive.saturating_sub(1).min(i32::MAX as u32) as i32;
    let scaled = (config.base_delay_ms as f64) * 2f64.powi(exp);
    let capped = scaled.min(config.max_backoff_ms as f64);

    Duration::from_millis(capped.max(0.0) as u64)
}

/// Doubles the pause for every deferral in a row, up to a cap.
///
/// The streak resets as soon as a job is skipped, completed or fails, so a
/// device that frees up quickly does not leave the worker sleeping long.
#[derive(Clone, Debug, Default)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn deferral_delay(&self, consecutive: u32) -> Duration {
        compute_backoff_delay(consecutive.max(1), &self.config)
    }
}
