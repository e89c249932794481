use leasehold_lease_store::OwnerToken;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Why a lease refresher stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Release, shutdown, or the manager was dropped.
    Cancelled,

    /// The record was no longer ours: taken over after expiry, or deleted.
    Lost,

    /// The store kept failing (or failed fatally) and the lease could not be
    /// extended.
    StoreUnavailable,
}

/// Liveness of a held lease as seen by its refresher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseState {
    /// The refresher is running and the last extension succeeded.
    Active,

    /// The refresher has stopped. Unless the reason is `Cancelled`, the
    /// lease should be treated as lost.
    Stopped(StopReason),
}

impl LeaseState {
    /// Whether the refresher is still extending the lease.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Snapshot of a lease held by a manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeldLease {
    /// The protected resource.
    pub resource_key: String,

    /// Token written into the lease record.
    pub owner_token: OwnerToken,

    /// Current refresher state.
    pub state: LeaseState,
}

/// In-process record of a held lease. Owned by the manager's lease table.
#[derive(Debug)]
pub struct LeaseHandle {
    resource_key: String,
    owner_token: OwnerToken,
    cancel: CancellationToken,
    state: watch::Receiver<LeaseState>,
    task: JoinHandle<()>,
}

impl LeaseHandle {
    pub const fn new(
        resource_key: String,
        owner_token: OwnerToken,
        cancel: CancellationToken,
        state: watch::Receiver<LeaseState>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            resource_key,
            owner_token,
            cancel,
            state,
            task,
        }
    }

    pub const fn owner_token(&self) -> &OwnerToken {
        &self.owner_token
    }

    pub fn state(&self) -> LeaseState {
        *self.state.borrow()
    }

    pub fn snapshot(&self) -> HeldLease {
        HeldLease {
            resource_key: self.resource_key.clone(),
            owner_token: self.owner_token,
            state: self.state(),
        }
    }

    /// Cancels the refresher and waits for it to exit, so no refresh can land
    /// after this returns.
    pub async fn stop(self) {
        self.cancel.cancel();

        if let Err(e) = self.task.await {
            warn!(key = %self.resource_key, error = %e, "Lease refresher task failed");
        }
    }
}
