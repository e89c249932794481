use std::sync::Arc;
use std::time::Duration;

use leasehold_lease_store::{Clock, ConditionalOutcome, LeaseStore, LeaseStoreError, OwnerToken};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::handle::{LeaseState, StopReason};

/// Background task that keeps one held lease alive by pushing its expiry
/// forward every refresh interval.
pub struct LeaseRefresher<S>
where
    S: LeaseStore,
{
    pub store: S,
    pub clock: Arc<dyn Clock>,
    pub storage_key: String,
    pub resource_key: String,
    pub owner_token: OwnerToken,
    pub lease_duration: Duration,
    pub refresh_interval: Duration,
    pub max_failures: u32,
    pub operation_timeout: Duration,
    pub cancel: CancellationToken,
    pub state: watch::Sender<LeaseState>,
}

impl<S> LeaseRefresher<S>
where
    S: LeaseStore,
{
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    #[instrument(skip(self), fields(key = %self.resource_key, owner = %self.owner_token))]
    async fn run(self) {
        debug!(interval = ?self.refresh_interval, "Lease refresher started");

        let reason = self.refresh_until_stopped().await;
        match reason {
            StopReason::Cancelled => debug!("Lease refresher stopped"),
            StopReason::Lost => warn!("Lease lost: record was taken over or deleted"),
            StopReason::StoreUnavailable => error!("Lease abandoned: store unavailable"),
        }

        self.state.send_replace(LeaseState::Stopped(reason));
    }

    async fn refresh_until_stopped(&self) -> StopReason {
        let mut ticker = interval_at(
            Instant::now() + self.refresh_interval,
            self.refresh_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut consecutive_failures = 0;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return StopReason::Cancelled,
                _ = ticker.tick() => {}
            }

            let new_expiry = self.clock.now() + self.lease_duration;

            // an abandoned extension is conditioned on our token, so it cannot
            // revive a lease someone else now owns
            let attempt = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return StopReason::Cancelled,
                result = timeout(
                    self.operation_timeout,
                    self.store.update_if_owner_matches(&self.storage_key, new_expiry, &self.owner_token),
                ) => result,
            };

            let failure = match attempt {
                Ok(Ok(ConditionalOutcome::Applied)) => {
                    if consecutive_failures > 0 {
                        info!(consecutive_failures, "Lease extension recovered");
                    }
                    consecutive_failures = 0;
                    debug!(expires_at = ?new_expiry, "Lease extended");
                    continue;
                }
                Ok(Ok(ConditionalOutcome::ConditionFailed)) => return StopReason::Lost,
                Ok(Err(e)) if !e.is_retriable() => {
                    error!(error = ?e, "Lease extension failed with non-retriable error");
                    return StopReason::StoreUnavailable;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_elapsed) => format!("timed out after {:?}", self.operation_timeout),
            };

            consecutive_failures += 1;
            warn!(
                attempt = consecutive_failures,
                max_attempts = self.max_failures,
                error = %failure,
                "Lease extension failed"
            );

            if consecutive_failures >= self.max_failures {
                return StopReason::StoreUnavailable;
            }
        }
    }
}
