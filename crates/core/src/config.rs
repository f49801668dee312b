//! Worker configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::reliability::BackoffPolicy;

/// Immutable configuration of one worker instance
///
/// Built once and shared read-only by every poll loop and dispatch.
///
/// # Example
///
/// ```
/// use extask_core::WorkerConfig;
/// use std::time::Duration;
///
/// let config = WorkerConfig::new("billing-worker-1")
///     .with_max_in_flight(20)
///     .with_lease_duration(Duration::from_secs(60))
///     .with_long_poll_timeout(Duration::from_secs(10));
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.claim_timeout(), Duration::from_secs(15));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Identifier sent with every claim and report
    pub worker_id: String,

    /// Maximum handler invocations running at once, across all topics
    pub max_in_flight: usize,

    /// Maximum tasks requested per claim
    pub max_tasks: usize,

    /// Lease requested for every claimed task
    #[serde(with = "duration_millis")]
    pub lease_duration: Duration,

    /// Server-side long-poll window of a claim
    #[serde(with = "duration_millis")]
    pub long_poll_timeout: Duration,

    /// Added to `long_poll_timeout` to form the client-side claim deadline
    #[serde(with = "duration_millis")]
    pub network_margin: Duration,

    /// Retries reported for a failed task the engine has no count for
    pub default_retries: u32,

    /// Delay before the engine offers a failed task again
    #[serde(with = "duration_millis")]
    pub default_retry_delay: Duration,

    /// Pause after a claim that returned no work
    #[serde(with = "duration_millis")]
    pub idle_sleep: Duration,

    /// Pause after a claim that failed
    pub error_backoff: BackoffPolicy,

    /// Deadline of a single outcome report
    #[serde(with = "duration_millis")]
    pub report_timeout: Duration,

    /// How long `stop` waits for dispatches to drain
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Ask the engine to offer higher-priority tasks first
    pub use_priority: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_in_flight: 10,
            max_tasks: 1,
            lease_duration: Duration::from_secs(300),
            long_poll_timeout: Duration::from_secs(5),
            network_margin: Duration::from_secs(5),
            default_retries: 3,
            default_retry_delay: Duration::from_secs(300),
            idle_sleep: Duration::from_secs(1),
            error_backoff: BackoffPolicy::fixed(Duration::from_secs(1)),
            report_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            use_priority: true,
        }
    }
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Reads `WORKER_ID`, `MAX_IN_FLIGHT`, `MAX_TASKS`, `LEASE_DURATION_MS`,
    /// `LONG_POLL_TIMEOUT_MS`, `DEFAULT_RETRIES`, `DEFAULT_RETRY_DELAY_MS`,
    /// `IDLE_SLEEP_MS` and `SHUTDOWN_TIMEOUT_MS`; unset or unparsable values
    /// keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let idle_sleep = env_millis("IDLE_SLEEP_MS").unwrap_or(defaults.idle_sleep);

        Self {
            worker_id: std::env::var("WORKER_ID").unwrap_or(defaults.worker_id),
            max_in_flight: env_parse("MAX_IN_FLIGHT").unwrap_or(defaults.max_in_flight),
            max_tasks: env_parse("MAX_TASKS").unwrap_or(defaults.max_tasks),
            lease_duration: env_millis("LEASE_DURATION_MS").unwrap_or(defaults.lease_duration),
            long_poll_timeout: env_millis("LONG_POLL_TIMEOUT_MS")
                .unwrap_or(defaults.long_poll_timeout),
            default_retries: env_parse("DEFAULT_RETRIES").unwrap_or(defaults.default_retries),
            default_retry_delay: env_millis("DEFAULT_RETRY_DELAY_MS")
                .unwrap_or(defaults.default_retry_delay),
            idle_sleep,
            error_backoff: BackoffPolicy::fixed(idle_sleep),
            shutdown_timeout: env_millis("SHUTDOWN_TIMEOUT_MS")
                .unwrap_or(defaults.shutdown_timeout),
            ..defaults
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    pub fn with_max_tasks(mut self, max: usize) -> Self {
        self.max_tasks = max;
        self
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    pub fn with_long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.long_poll_timeout = timeout;
        self
    }

    pub fn with_network_margin(mut self, margin: Duration) -> Self {
        self.network_margin = margin;
        self
    }

    pub fn with_default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn with_default_retry_delay(mut self, delay: Duration) -> Self {
        self.default_retry_delay = delay;
        self
    }

    /// Set the idle sleep; a fixed error backoff follows it
    pub fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = sleep;
        if self.error_backoff.backoff_coefficient <= 1.0 {
            self.error_backoff = BackoffPolicy::fixed(sleep);
        }
        self
    }

    pub fn with_error_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.error_backoff = policy;
        self
    }

    pub fn with_report_timeout(mut self, timeout: Duration) -> Self {
        self.report_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_use_priority(mut self, use_priority: bool) -> Self {
        self.use_priority = use_priority;
        self
    }

    /// Client-side deadline of one claim call
    ///
    /// Strictly greater than the long-poll window, so an empty answer after the
    /// full window is never mistaken for a client timeout.
    pub fn claim_timeout(&self) -> Duration {
        self.long_poll_timeout + self.network_margin
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_id.trim().is_empty() {
            return Err(ConfigError::Invalid("worker_id must not be empty".into()));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid("max_in_flight must be at least 1".into()));
        }
        if self.max_tasks == 0 {
            return Err(ConfigError::Invalid("max_tasks must be at least 1".into()));
        }
        if self.max_tasks > self.max_in_flight {
            return Err(ConfigError::Invalid(format!(
                "max_tasks ({}) must not exceed max_in_flight ({})",
                self.max_tasks, self.max_in_flight
            )));
        }
        if self.lease_duration.is_zero() {
            return Err(ConfigError::Invalid("lease_duration must be positive".into()));
        }
        if self.long_poll_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "long_poll_timeout must be positive".into(),
            ));
        }
        if self.network_margin.is_zero() {
            return Err(ConfigError::Invalid(
                "network_margin must be positive so the claim deadline exceeds the long poll"
                    .into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.max_in_flight, 10);
        assert_eq!(config.max_tasks, 1);
        assert_eq!(config.lease_duration, Duration::from_secs(300));
        assert_eq!(config.default_retries, 3);
        assert_eq!(config.default_retry_delay, Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerConfig::new("w-1")
            .with_max_in_flight(4)
            .with_max_tasks(2)
            .with_idle_sleep(Duration::from_millis(250))
            .with_default_retries(5);

        assert_eq!(config.worker_id, "w-1");
        assert_eq!(config.max_in_flight, 4);
        assert_eq!(config.max_tasks, 2);
        assert_eq!(config.idle_sleep, Duration::from_millis(250));
        assert_eq!(
            config.error_backoff,
            BackoffPolicy::fixed(Duration::from_millis(250))
        );
        assert_eq!(config.default_retries, 5);
    }

    #[test]
    fn test_idle_sleep_keeps_exponential_backoff() {
        let config = WorkerConfig::new("w-1")
            .with_error_backoff(BackoffPolicy::exponential())
            .with_idle_sleep(Duration::from_millis(250));
        assert_eq!(config.error_backoff, BackoffPolicy::exponential());
    }

    #[test]
    fn test_claim_timeout_exceeds_long_poll() {
        let config = WorkerConfig::new("w-1").with_long_poll_timeout(Duration::from_secs(20));
        assert!(config.claim_timeout() > config.long_poll_timeout);
    }

    #[test]
    fn test_validation() {
        assert!(WorkerConfig::new("").validate().is_err());
        assert!(WorkerConfig::new("w").with_max_in_flight(0).validate().is_err());
        assert!(WorkerConfig::new("w").with_max_tasks(0).validate().is_err());
        assert!(WorkerConfig::new("w")
            .with_max_in_flight(2)
            .with_max_tasks(3)
            .validate()
            .is_err());
        assert!(WorkerConfig::new("w")
            .with_lease_duration(Duration::ZERO)
            .validate()
            .is_err());
        assert!(WorkerConfig::new("w")
            .with_network_margin(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_serialization() {
        let config = WorkerConfig::new("w-1");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["lease_duration"], 300_000);
        let parsed: WorkerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }
}
