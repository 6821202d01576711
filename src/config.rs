#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use bon::Builder;

use crate::Result;
use crate::backoff::BackoffPolicy;
use crate::error::Error;

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_millis(1000);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_millis(800);
const DEFAULT_MAX_HEARTBEAT_FAILURES: u32 = 3;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_REQUEST_TIMEOUT_DURATION: Duration = Duration::from_secs(5);

/// Configuration for a [`ConnectionManager`](crate::manager::ConnectionManager).
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Liveness and membership verification
    #[builder(default)]
    pub heartbeat: HeartbeatConfig,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    /// Upper bound on opening the channel and on waiting for a join acknowledgement
    #[builder(default = DEFAULT_REQUEST_TIMEOUT_DURATION)]
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT_DURATION,
        }
    }
}

impl Config {
    /// Reject settings under which the manager could spin or never time out.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.interval.is_zero() {
            return Err(Error::validation("heartbeat interval must be non-zero"));
        }
        if self.heartbeat.timeout.is_zero() {
            return Err(Error::validation("heartbeat timeout must be non-zero"));
        }
        if self.heartbeat.max_failures == 0 {
            return Err(Error::validation("heartbeat max_failures must be at least 1"));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::validation("request timeout must be non-zero"));
        }
        let backoff = self.reconnect.backoff;
        if backoff.base.is_zero() {
            return Err(Error::validation("backoff base delay must be non-zero"));
        }
        if backoff.cap < backoff.base {
            return Err(Error::validation(format!(
                "backoff cap {:?} is shorter than base delay {:?}",
                backoff.cap, backoff.base
            )));
        }

        Ok(())
    }
}

/// Heartbeat cadence and escalation threshold.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct HeartbeatConfig {
    /// Interval between membership pings
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL_DURATION)]
    pub interval: Duration,
    /// Maximum time to wait for a ping reply before counting a failure
    #[builder(default = DEFAULT_HEARTBEAT_TIMEOUT_DURATION)]
    pub timeout: Duration,
    /// Consecutive failures that force a reconnection
    #[builder(default = DEFAULT_MAX_HEARTBEAT_FAILURES)]
    pub max_failures: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT_DURATION,
            max_failures: DEFAULT_MAX_HEARTBEAT_FAILURES,
        }
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ReconnectConfig {
    /// Failed retries after which the manager stops trying on its own
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,
    /// Delay schedule between retries
    #[builder(default)]
    pub backoff: BackoffPolicy,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    #[test]
    fn defaults() {
        let config = Config::default();

        assert_eq!(config.heartbeat.interval, Duration::from_millis(1000));
        assert_eq!(config.heartbeat.timeout, Duration::from_millis(800));
        assert_eq!(config.heartbeat.max_failures, 3);
        assert_eq!(config.reconnect.max_retries, 5);
        assert_eq!(config.reconnect.backoff, BackoffPolicy::default());
        config.validate().unwrap();
    }

    #[test]
    fn builder_fills_defaults() {
        let config = Config::builder()
            .heartbeat(
                HeartbeatConfig::builder()
                    .interval(Duration::from_millis(250))
                    .build(),
            )
            .build();

        assert_eq!(config.heartbeat.interval, Duration::from_millis(250));
        assert_eq!(config.heartbeat.timeout, Duration::from_millis(800));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn rejects_zero_interval() {
        let config = Config::builder()
            .heartbeat(HeartbeatConfig::builder().interval(Duration::ZERO).build())
            .build();

        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), Kind::Validation);
    }

    #[test]
    fn rejects_cap_below_base() {
        let config = Config::builder()
            .reconnect(
                ReconnectConfig::builder()
                    .backoff(BackoffPolicy::new(
                        Duration::from_secs(2),
                        Duration::from_secs(1),
                    ))
                    .build(),
            )
            .build();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("shorter than base delay"));
    }
}
