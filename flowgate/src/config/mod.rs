//! Engine configuration.
//!
//! Values come from serde defaults, optionally a JSON document, and
//! finally `FLOWGATE_*` environment variables (a `.env` file is loaded
//! first when present).

use crate::errors::{ConfigError, FlowgateError, Result};
use crate::quota::QuotaLimits;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowgateConfig {
    /// Retry policy for transient storage errors.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Timeouts for steps, warehouse operations and shutdown.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Default quota limits for tenants without overrides.
    #[serde(default)]
    pub quota: QuotaDefaults,
    /// Partitioned query fan-out.
    #[serde(default)]
    pub partition: PartitionConfig,
    /// Idempotent writer batching.
    #[serde(default)]
    pub writer: WriterConfig,
    /// Run state lifecycle.
    #[serde(default)]
    pub state: StateConfig,
    /// Worker pool.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Logging output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Timeouts, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Default bound for one step.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// Bound for one warehouse operation.
    #[serde(default = "default_warehouse_timeout_secs")]
    pub warehouse_timeout_secs: u64,
    /// How long in-flight partitions may finish after cancellation.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

const fn default_step_timeout_secs() -> u64 {
    3600
}

const fn default_warehouse_timeout_secs() -> u64 {
    600
}

const fn default_grace_period_secs() -> u64 {
    30
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout_secs(),
            warehouse_timeout_secs: default_warehouse_timeout_secs(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

impl TimeoutConfig {
    /// Default step bound.
    #[must_use]
    pub const fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    /// Warehouse operation bound.
    #[must_use]
    pub const fn warehouse_timeout(&self) -> Duration {
        Duration::from_secs(self.warehouse_timeout_secs)
    }

    /// Cancellation grace period.
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Default quota limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDefaults {
    /// Runs per tenant per day.
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u64,
    /// Runs per tenant per calendar month.
    #[serde(default = "default_monthly_limit")]
    pub monthly_limit: u64,
    /// Concurrently running runs per tenant.
    #[serde(default = "default_concurrent_limit")]
    pub concurrent_limit: u64,
}

const fn default_daily_limit() -> u64 {
    100
}

const fn default_monthly_limit() -> u64 {
    2000
}

const fn default_concurrent_limit() -> u64 {
    3
}

impl Default for QuotaDefaults {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            monthly_limit: default_monthly_limit(),
            concurrent_limit: default_concurrent_limit(),
        }
    }
}

impl QuotaDefaults {
    /// Converts to quota limits.
    #[must_use]
    pub const fn limits(&self) -> QuotaLimits {
        QuotaLimits {
            daily: self.daily_limit,
            monthly: self.monthly_limit,
            concurrent: self.concurrent_limit,
        }
    }
}

/// Partitioned query settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Maximum partitions in flight per batch.
    #[serde(default = "default_partition_batch_size")]
    pub batch_size: usize,
}

const fn default_partition_batch_size() -> usize {
    10
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_partition_batch_size(),
        }
    }
}

/// Writer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Rows per merge statement.
    #[serde(default = "default_merge_batch_size")]
    pub merge_batch_size: usize,
}

const fn default_merge_batch_size() -> usize {
    500
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            merge_batch_size: default_merge_batch_size(),
        }
    }
}

/// Run lifecycle settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfig {
    /// Failed attempts after which a run is no longer retried.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Age after which a `RUNNING` run counts as abandoned.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_stale_after_secs() -> u64 {
    7200
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Runs executing at once across all tenants.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// Seconds between due-run sweeps.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

const fn default_max_concurrent_runs() -> usize {
    8
}

const fn default_poll_interval_secs() -> u64 {
    30
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl WorkerConfig {
    /// Sweep interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// JSON lines for production.
    Json,
    /// Human-readable output.
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl FlowgateConfig {
    /// Loads configuration from defaults and the environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON document; missing sections take their defaults.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| FlowgateError::config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `FLOWGATE_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_from(&lookup, "FLOWGATE_RETRY_MAX_ATTEMPTS", &mut self.retry.max_attempts)?;
        override_from(&lookup, "FLOWGATE_RETRY_BASE_DELAY_MS", &mut self.retry.base_delay_ms)?;
        override_from(&lookup, "FLOWGATE_RETRY_MAX_DELAY_MS", &mut self.retry.max_delay_ms)?;
        override_from(&lookup, "FLOWGATE_STEP_TIMEOUT_SECS", &mut self.timeouts.step_timeout_secs)?;
        override_from(
            &lookup,
            "FLOWGATE_WAREHOUSE_TIMEOUT_SECS",
            &mut self.timeouts.warehouse_timeout_secs,
        )?;
        override_from(&lookup, "FLOWGATE_GRACE_PERIOD_SECS", &mut self.timeouts.grace_period_secs)?;
        override_from(&lookup, "FLOWGATE_QUOTA_DAILY", &mut self.quota.daily_limit)?;
        override_from(&lookup, "FLOWGATE_QUOTA_MONTHLY", &mut self.quota.monthly_limit)?;
        override_from(&lookup, "FLOWGATE_QUOTA_CONCURRENT", &mut self.quota.concurrent_limit)?;
        override_from(&lookup, "FLOWGATE_PARTITION_BATCH_SIZE", &mut self.partition.batch_size)?;
        override_from(&lookup, "FLOWGATE_MERGE_BATCH_SIZE", &mut self.writer.merge_batch_size)?;
        override_from(&lookup, "FLOWGATE_MAX_RETRIES", &mut self.state.max_retries)?;
        override_from(&lookup, "FLOWGATE_STALE_AFTER_SECS", &mut self.state.stale_after_secs)?;
        override_from(&lookup, "FLOWGATE_MAX_CONCURRENT_RUNS", &mut self.worker.max_concurrent_runs)?;
        override_from(&lookup, "FLOWGATE_POLL_INTERVAL_SECS", &mut self.worker.poll_interval_secs)?;
        override_from(&lookup, "FLOWGATE_LOG_LEVEL", &mut self.logging.level)?;
        override_from(&lookup, "FLOWGATE_LOG_FORMAT", &mut self.logging.format)?;
        Ok(())
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.retry.max_attempts == 0, "retry.max_attempts"),
            (self.partition.batch_size == 0, "partition.batch_size"),
            (self.writer.merge_batch_size == 0, "writer.merge_batch_size"),
            (self.worker.max_concurrent_runs == 0, "worker.max_concurrent_runs"),
            (self.worker.poll_interval_secs == 0, "worker.poll_interval_secs"),
            (self.timeouts.step_timeout_secs == 0, "timeouts.step_timeout_secs"),
            (self.timeouts.warehouse_timeout_secs == 0, "timeouts.warehouse_timeout_secs"),
        ];
        for (invalid, field) in checks {
            if invalid {
                return Err(ConfigError::new(format!("{field} must be greater than zero"))
                    .with_field(field)
                    .into());
            }
        }
        Ok(())
    }
}

fn override_from<T, F>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|e: T::Err| {
            FlowgateError::from(
                ConfigError::new(format!("invalid value '{raw}' for {key}: {e}")).with_field(key),
            )
        })?;
    }
    Ok(())
}
