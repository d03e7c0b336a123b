//! Bounded retries for transient storage failures.
//!
//! Only errors whose [`FlowgateError::is_transient`] is true are retried.
//! Anything else reaches the caller after the first attempt.

use crate::errors::FlowgateError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// How the un-jittered delay grows between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * 2^retry`
    #[default]
    Exponential,
    /// `base * (retry + 1)`
    Linear,
    /// `base`
    Constant,
}

/// How a computed delay is spread across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Use the computed delay as is.
    None,
    /// Uniform in `0..=delay`.
    #[default]
    Full,
    /// `delay / 2` plus uniform in `0..=delay / 2`.
    Equal,
    /// Uniform in `base..=previous * 3`, capped. Ignores the backoff strategy.
    Decorrelated,
}

impl JitterStrategy {
    fn apply<R: Rng + ?Sized>(self, delay_ms: u64, previous_ms: u64, config: &RetryConfig, rng: &mut R) -> u64 {
        match self {
            Self::None => delay_ms,
            Self::Full if delay_ms == 0 => 0,
            Self::Full => rng.gen_range(0..=delay_ms),
            Self::Equal => {
                let half = delay_ms / 2;
                half + rng.gen_range(0..=delay_ms - half)
            }
            Self::Decorrelated => {
                let upper = previous_ms.saturating_mul(3).min(config.max_delay_ms);
                if upper <= config.base_delay_ms {
                    upper
                } else {
                    rng.gen_range(config.base_delay_ms..=upper)
                }
            }
        }
    }
}

/// Retry policy for storage and warehouse round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth of the delay between retries.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Spread applied to each delay.
    #[serde(default)]
    pub jitter_strategy: JitterStrategy,
}

const fn default_max_attempts() -> usize {
    5
}

const fn default_base_delay_ms() -> u64 {
    200
}

const fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_strategy: BackoffStrategy::default(),
            jitter_strategy: JitterStrategy::default(),
        }
    }
}

impl RetryConfig {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that makes a single attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the first retry delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    /// Un-jittered delay before retry number `retry` (zero-based), capped.
    #[must_use]
    pub fn nominal_delay_ms(&self, retry: u32) -> u64 {
        let base = self.base_delay_ms;
        let delay = match self.backoff_strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(retry)),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retry).saturating_add(1)),
            BackoffStrategy::Constant => base,
        };
        delay.min(self.max_delay_ms)
    }

    /// The delays of one retry loop, with an entropy-seeded RNG.
    #[must_use]
    pub fn backoff(&self) -> Backoff<'_, StdRng> {
        Backoff::with_rng(self, StdRng::from_entropy())
    }
}

/// The sequence of delays for one operation.
///
/// Yields `max_attempts - 1` delays, then `None`.
#[derive(Debug)]
pub struct Backoff<'a, R> {
    config: &'a RetryConfig,
    retry: u32,
    previous_ms: u64,
    rng: R,
}

impl<'a, R: Rng> Backoff<'a, R> {
    /// Creates a sequence drawing jitter from `rng`.
    pub fn with_rng(config: &'a RetryConfig, rng: R) -> Self {
        Self {
            config,
            retry: 0,
            previous_ms: config.base_delay_ms,
            rng,
        }
    }

    /// Retries handed out so far.
    pub const fn retries(&self) -> u32 {
        self.retry
    }
}

impl<R: Rng> Iterator for Backoff<'_, R> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let allowed = self.config.max_attempts.saturating_sub(1);
        if usize::try_from(self.retry).map_or(true, |r| r >= allowed) {
            return None;
        }

        let nominal = self.config.nominal_delay_ms(self.retry);
        let delay = self
            .config
            .jitter_strategy
            .apply(nominal, self.previous_ms, self.config, &mut self.rng);
        self.previous_ms = delay;
        self.retry += 1;
        Some(Duration::from_millis(delay))
    }
}

/// Runs `operation`, retrying transient failures with backoff.
///
/// `key` names the operation in logs. Transient errors that eventually
/// succeed are invisible to the caller.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    key: &str,
    mut operation: F,
) -> Result<T, FlowgateError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FlowgateError>>,
{
    let mut backoff = config.backoff();

    loop {
        let error = match operation().await {
            Ok(value) => {
                if backoff.retries() > 0 {
                    tracing::debug!(operation = key, retries = backoff.retries(), "recovered after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => e,
        };

        let Some(delay) = backoff.next() else {
            tracing::warn!(
                operation = key,
                attempts = backoff.retries() + 1,
                kind = %error.kind(),
                error = %error,
                "retries exhausted"
            );
            return Err(error);
        };
        tracing::debug!(
            operation = key,
            retry = backoff.retries(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "transient failure, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}
