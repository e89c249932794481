use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-call options for [`LeaseLockManager::acquire_with`].
///
/// Unset timings fall back to the manager's configuration. Without a
/// deadline, timeout or cancellation token the call waits for as long as the
/// lease is held elsewhere.
///
/// [`LeaseLockManager::acquire_with`]: crate::LeaseLockManager::acquire_with
#[derive(Clone, Debug, Default)]
pub struct AcquireOptions {
    pub(crate) lease_duration: Option<Duration>,
    pub(crate) refresh_interval: Option<Duration>,
    pub(crate) poll_interval: Option<Duration>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancellation: Option<CancellationToken>,
}

impl AcquireOptions {
    /// Options that defer everything to the manager configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the lease duration for this acquisition.
    #[must_use]
    pub const fn lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = Some(lease_duration);
        self
    }

    /// Overrides the refresh interval for this acquisition.
    #[must_use]
    pub const fn refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = Some(refresh_interval);
        self
    }

    /// Overrides the poll interval for this acquisition.
    #[must_use]
    pub const fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }

    /// Gives up at `deadline`.
    #[must_use]
    pub const fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Gives up once `timeout` has elapsed since the call started. Combined
    /// with a deadline, whichever comes first applies.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Aborts the acquisition when `token` is cancelled.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub(crate) fn effective_deadline(&self, started: Instant) -> Option<Instant> {
        let from_timeout = self.timeout.map(|timeout| started + timeout);

        match (self.deadline, from_timeout) {
            (Some(deadline), Some(from_timeout)) => Some(deadline.min(from_timeout)),
            (deadline, from_timeout) => deadline.or(from_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_effective_deadline() {
        let started = Instant::now();

        assert_eq!(AcquireOptions::new().effective_deadline(started), None);
        assert_eq!(
            AcquireOptions::new()
                .timeout(Duration::from_secs(2))
                .effective_deadline(started),
            Some(started + Duration::from_secs(2))
        );
        assert_eq!(
            AcquireOptions::new()
                .timeout(Duration::from_secs(2))
                .deadline(started + Duration::from_secs(1))
                .effective_deadline(started),
            Some(started + Duration::from_secs(1))
        );
        assert_eq!(
            AcquireOptions::new()
                .timeout(Duration::from_secs(2))
                .deadline(started + Duration::from_secs(5))
                .effective_deadline(started),
            Some(started + Duration::from_secs(2))
        );
    }
}
