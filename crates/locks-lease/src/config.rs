use std::sync::Arc;
use std::time::Duration;

use leasehold_lease_store::{Clock, SystemClock};

use crate::options::AcquireOptions;
use crate::retry::RetryPolicy;

const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
const DEFAULT_MAX_REFRESH_FAILURES: u32 = 3;
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

// default refresh and poll cadence, relative to the lease duration
const REFRESHES_PER_LEASE: u32 = 3;
const POLLS_PER_LEASE: u32 = 10;

/// Configuration for the `LeaseLockManager`.
#[derive(Clone, Debug, Default)]
pub struct LeaseLockManagerConfig {
    /// How long a lease lasts without being extended. Defaults to 15 seconds
    /// if not set.
    pub lease_duration: Option<Duration>,

    /// How often a held lease is extended. Must be shorter than the lease
    /// duration. Defaults to a third of the lease duration if not set.
    pub refresh_interval: Option<Duration>,

    /// How long to wait between acquisition attempts while another owner
    /// holds the lease. Defaults to a tenth of the lease duration if not set.
    pub poll_interval: Option<Duration>,

    /// Consecutive failed extensions after which a lease is given up.
    /// Defaults to 3 if not set.
    pub max_refresh_failures: Option<u32>,

    /// Timeout for individual store operations. Defaults to 10 seconds if not set.
    pub operation_timeout: Option<Duration>,

    /// Maximum number of attempts for failed store operations. Defaults to 3 if not set.
    pub max_retries: Option<usize>,

    /// Base delay for exponential backoff between retries. Defaults to 100ms if not set.
    pub retry_base_delay: Option<Duration>,

    /// Maximum delay for exponential backoff. Defaults to 5 seconds if not set.
    pub retry_max_delay: Option<Duration>,

    /// Source of wall-clock time for expiry stamps. Defaults to the system clock.
    pub clock: Option<Arc<dyn Clock>>,
}

/// Resolved manager-wide settings.
#[derive(Clone, Debug)]
pub struct Settings {
    lease_duration: Duration,
    refresh_interval: Option<Duration>,
    poll_interval: Option<Duration>,
    pub max_refresh_failures: u32,
    pub retry: RetryPolicy,
}

/// Timings governing a single acquisition and the lease it produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseTiming {
    pub lease_duration: Duration,
    pub refresh_interval: Duration,
    pub poll_interval: Duration,
}

impl Settings {
    pub fn resolve(
        config: LeaseLockManagerConfig,
    ) -> Result<(Self, Arc<dyn Clock>), String> {
        let LeaseLockManagerConfig {
            lease_duration,
            refresh_interval,
            poll_interval,
            max_refresh_failures,
            operation_timeout,
            max_retries,
            retry_base_delay,
            retry_max_delay,
            clock,
        } = config;

        let settings = Self {
            lease_duration: lease_duration.unwrap_or(DEFAULT_LEASE_DURATION),
            refresh_interval,
            poll_interval,
            max_refresh_failures: max_refresh_failures.unwrap_or(DEFAULT_MAX_REFRESH_FAILURES),
            retry: RetryPolicy {
                operation_timeout: operation_timeout.unwrap_or(DEFAULT_OPERATION_TIMEOUT),
                max_retries: max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
                base_delay: retry_base_delay.unwrap_or(DEFAULT_RETRY_BASE_DELAY),
                max_delay: retry_max_delay.unwrap_or(DEFAULT_RETRY_MAX_DELAY),
            },
        };

        settings.validate()?;
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));

        Ok((settings, clock))
    }

    fn validate(&self) -> Result<(), String> {
        self.timing(&AcquireOptions::default())?;

        if self.max_refresh_failures == 0 {
            return Err("max refresh failures must be at least 1".to_string());
        }
        if self.retry.max_retries == 0 {
            return Err("max retries must be at least 1".to_string());
        }
        if self.retry.operation_timeout.is_zero() {
            return Err("operation timeout must be greater than zero".to_string());
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err("retry base delay exceeds retry max delay".to_string());
        }

        Ok(())
    }

    /// Resolves the timings for an acquisition. Per-call overrides win; a
    /// configured refresh interval only applies to the configured lease
    /// duration.
    pub fn timing(&self, options: &AcquireOptions) -> Result<LeaseTiming, String> {
        let lease_duration = options.lease_duration.unwrap_or(self.lease_duration);
        let configured_refresh = if options.lease_duration.is_some() {
            None
        } else {
            self.refresh_interval
        };

        let timing = LeaseTiming {
            lease_duration,
            refresh_interval: options
                .refresh_interval
                .or(configured_refresh)
                .unwrap_or(lease_duration / REFRESHES_PER_LEASE),
            poll_interval: options
                .poll_interval
                .or(self.poll_interval)
                .unwrap_or(lease_duration / POLLS_PER_LEASE),
        };

        if timing.lease_duration.is_zero() {
            return Err("lease duration must be greater than zero".to_string());
        }
        if timing.refresh_interval.is_zero() {
            return Err("refresh interval must be greater than zero".to_string());
        }
        if timing.refresh_interval >= timing.lease_duration {
            return Err(format!(
                "refresh interval {:?} must be shorter than lease duration {:?}",
                timing.refresh_interval, timing.lease_duration
            ));
        }
        if timing.poll_interval.is_zero() {
            return Err("poll interval must be greater than zero".to_string());
        }

        Ok(timing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn settings(config: LeaseLockManagerConfig) -> Settings {
        Settings::resolve(config).unwrap().0
    }

    #[test]
    fn test_defaults() {
        let settings = settings(LeaseLockManagerConfig::default());

        assert_eq!(
            settings.timing(&AcquireOptions::default()).unwrap(),
            LeaseTiming {
                lease_duration: Duration::from_secs(15),
                refresh_interval: Duration::from_secs(5),
                poll_interval: Duration::from_millis(1500),
            }
        );
        assert_eq!(settings.max_refresh_failures, 3);
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.retry.operation_timeout, Duration::from_secs(10));
        assert_eq!(settings.retry.base_delay, Duration::from_millis(100));
        assert_eq!(settings.retry.max_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_per_call_overrides() {
        let settings = settings(LeaseLockManagerConfig {
            lease_duration: Some(Duration::from_secs(30)),
            refresh_interval: Some(Duration::from_secs(20)),
            poll_interval: Some(Duration::from_secs(1)),
            ..LeaseLockManagerConfig::default()
        });

        // configured refresh interval is tied to the configured lease
        let timing = settings
            .timing(&AcquireOptions::new().lease_duration(Duration::from_secs(3)))
            .unwrap();
        assert_eq!(timing.lease_duration, Duration::from_secs(3));
        assert_eq!(timing.refresh_interval, Duration::from_secs(1));
        assert_eq!(timing.poll_interval, Duration::from_secs(1));

        let timing = settings
            .timing(&AcquireOptions::new().poll_interval(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(timing.refresh_interval, Duration::from_secs(20));
        assert_eq!(timing.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_invalid_config() {
        assert_matches!(
            Settings::resolve(LeaseLockManagerConfig {
                lease_duration: Some(Duration::ZERO),
                ..LeaseLockManagerConfig::default()
            }),
            Err(_)
        );
        assert_matches!(
            Settings::resolve(LeaseLockManagerConfig {
                lease_duration: Some(Duration::from_secs(5)),
                refresh_interval: Some(Duration::from_secs(5)),
                ..LeaseLockManagerConfig::default()
            }),
            Err(_)
        );
        assert_matches!(
            Settings::resolve(LeaseLockManagerConfig {
                max_retries: Some(0),
                ..LeaseLockManagerConfig::default()
            }),
            Err(_)
        );
        assert_matches!(
            Settings::resolve(LeaseLockManagerConfig {
                retry_base_delay: Some(Duration::from_secs(10)),
                ..LeaseLockManagerConfig::default()
            }),
            Err(_)
        );
    }

    #[test]
    fn test_invalid_per_call_timing() {
        let settings = settings(LeaseLockManagerConfig::default());

        assert!(
            settings
                .timing(&AcquireOptions::new().lease_duration(Duration::ZERO))
                .is_err()
        );
        assert!(
            settings
                .timing(&AcquireOptions::new().poll_interval(Duration::ZERO))
                .is_err()
        );
        assert!(
            settings
                .timing(&AcquireOptions::new().refresh_interval(Duration::from_secs(15)))
                .is_err()
        );
    }
}
