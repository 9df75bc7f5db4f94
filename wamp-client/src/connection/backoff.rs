use std::time::Duration;

use rand::Rng;
use rand_distr::{
    Distribution,
    Normal,
};

use crate::connection::config::{
    ConnectionConfig,
    MaxRetries,
};

/// Retry tracking across failed connection attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryState {
    /// Attempts made since the last successful connection.
    pub count: u32,
    /// The delay, in seconds, before jitter and capping, for the next attempt.
    pub delay: f64,
}

/// The decision for the next reconnection attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NextRetry {
    /// How long to wait before retrying; `None` when no retry will happen.
    pub delay: Option<Duration>,
    /// The number of the upcoming attempt; `None` when no retry will happen.
    pub count: Option<u32>,
    pub will_retry: bool,
}

impl NextRetry {
    fn none() -> Self {
        Self {
            delay: None,
            count: None,
            will_retry: false,
        }
    }
}

/// Exponential backoff with Gaussian jitter and an upper bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub max_retries: MaxRetries,
    pub initial_delay: f64,
    pub max_delay: f64,
    pub growth: f64,
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.initial_retry_delay,
            max_delay: config.max_retry_delay,
            growth: config.retry_delay_growth,
            jitter: config.retry_delay_jitter,
        }
    }

    /// Retry tracking after a successful connection.
    pub fn initial_state(&self) -> RetryState {
        RetryState {
            count: 0,
            delay: self.initial_delay,
        }
    }

    /// Advances retry tracking after a failure and decides whether to retry.
    ///
    /// Jitter and the upper bound apply to the delay used now. Growth applies afterwards, so it
    /// only affects the following attempt.
    pub fn advance<R>(&self, state: &mut RetryState, retry_enabled: bool, rng: &mut R) -> NextRetry
    where
        R: Rng + ?Sized,
    {
        let mut delay = state.delay;
        if self.jitter > 0.0 {
            if let Ok(distribution) = Normal::new(delay, delay * self.jitter) {
                delay = distribution.sample(rng);
            }
        }
        let delay = if delay.is_nan() {
            self.max_delay
        } else {
            delay.max(0.0).min(self.max_delay)
        };

        state.count = state.count.saturating_add(1);
        let will_retry = retry_enabled && self.max_retries.allows(state.count);
        state.delay = (state.delay * self.growth).min(f64::MAX);

        if !will_retry {
            return NextRetry::none();
        }
        NextRetry {
            delay: Some(Duration::try_from_secs_f64(delay).unwrap_or(Duration::MAX)),
            count: Some(state.count),
            will_retry,
        }
    }
}
