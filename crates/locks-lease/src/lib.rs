//! Distributed mutual exclusion built from leases in a conditional-write
//! key-value store.
//!
//! A lock is a lease record naming its owner's token and an expiry. Holders
//! keep the record alive with a background refresher; a holder that dies
//! simply stops refreshing and the lease becomes available once it expires.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod error;
mod handle;
mod options;
mod refresher;
mod retry;

pub use config::LeaseLockManagerConfig;
pub use error::Error;
pub use handle::{HeldLease, LeaseState, StopReason};
pub use options::AcquireOptions;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use leasehold_lease_store::{
    Clock, ConditionalOutcome, LeaseRecord, LeaseStore, OwnerToken, PutOutcome,
};
use leasehold_locks::{
    LockManager, LockManager1, LockManager2, LockManager3, LockStatus, ReleaseOutcome,
};
use tokio::sync::watch;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use config::{LeaseTiming, Settings};
use handle::LeaseHandle;
use refresher::LeaseRefresher;

/// What stopped an acquisition before it succeeded.
enum Interruption {
    Cancelled,
    DeadlineExceeded,
}

struct Inner<S>
where
    S: LeaseStore,
{
    store: S,
    clock: Arc<dyn Clock>,
    settings: Settings,
    scope: Option<String>,
    leases: DashMap<String, LeaseHandle>,
    shutdown: CancellationToken,
    // a scoped manager's token is a child of its parent's, which must not be
    // cancelled by the parent dropping first
    _parent: Option<Arc<Inner<S>>>,
}

impl<S> Drop for Inner<S>
where
    S: LeaseStore,
{
    fn drop(&mut self) {
        // refreshers must not outlive the last manager handle
        self.shutdown.cancel();
    }
}

/// A distributed lock manager that holds leases in a [`LeaseStore`].
///
/// Clones share the same lease table. Leases are only released explicitly;
/// when the last clone is dropped the refreshers stop and any remaining leases
/// expire on their own. A scoped manager keeps its parent alive, but the
/// parent's [`shutdown`](Self::shutdown) also stops the scoped refreshers.
pub struct LeaseLockManager<S>
where
    S: LeaseStore,
{
    inner: Arc<Inner<S>>,
}

impl<S> Clone for LeaseLockManager<S>
where
    S: LeaseStore,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> std::fmt::Debug for LeaseLockManager<S>
where
    S: LeaseStore + std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLockManager")
            .field("store", &self.inner.store)
            .field("scope", &self.inner.scope)
            .field("held", &self.inner.leases.len())
            .finish_non_exhaustive()
    }
}

impl<S> LeaseLockManager<S>
where
    S: LeaseStore,
{
    /// Creates a new `LeaseLockManager` over `store`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configured timings are
    /// inconsistent, e.g. a refresh interval not shorter than the lease.
    pub fn new(store: S, config: LeaseLockManagerConfig) -> Result<Self, Error<S::Error>> {
        let (settings, clock) = Settings::resolve(config).map_err(Error::InvalidConfig)?;

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                clock,
                settings,
                scope: None,
                leases: DashMap::new(),
                shutdown: CancellationToken::new(),
                _parent: None,
            }),
        })
    }

    fn scoped(&self, scope: &str) -> Self {
        let scope = match &self.inner.scope {
            Some(parent) => format!("{parent}/{scope}"),
            None => scope.to_string(),
        };

        Self {
            inner: Arc::new(Inner {
                store: self.inner.store.clone(),
                clock: Arc::clone(&self.inner.clock),
                settings: self.inner.settings.clone(),
                scope: Some(scope),
                leases: DashMap::new(),
                shutdown: self.inner.shutdown.child_token(),
                _parent: Some(Arc::clone(&self.inner)),
            }),
        }
    }

    fn storage_key(&self, resource_key: &str) -> String {
        let key = LeaseRecord::storage_key(resource_key);

        match &self.inner.scope {
            Some(scope) => format!("{scope}/{key}"),
            None => key,
        }
    }

    fn validate_key(resource_key: &str) -> Result<(), Error<S::Error>> {
        if resource_key.is_empty() {
            return Err(Error::InvalidInput(
                "resource key must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Acquires the lease on `resource_key`, waiting while another owner holds
    /// it.
    ///
    /// On success a background refresher keeps the lease alive until
    /// [`release`](LockManager::release) or [`shutdown`](Self::shutdown).
    /// Dropping the returned future abandons the attempt.
    ///
    /// # Errors
    ///
    /// - [`Error::DeadlineExceeded`] if the deadline or timeout passes first.
    /// - [`Error::Cancelled`] if the cancellation token fires or the manager
    ///   shuts down.
    /// - [`Error::AlreadyHeld`] if this manager already holds the lease.
    /// - [`Error::InvalidInput`] for an empty key or invalid timings.
    /// - A store error if the store keeps failing after all retries.
    #[instrument(skip(self, options), fields(key = %resource_key))]
    pub async fn acquire_with(
        &self,
        resource_key: &str,
        options: AcquireOptions,
    ) -> Result<(), Error<S::Error>> {
        Self::validate_key(resource_key)?;
        let timing = self
            .inner
            .settings
            .timing(&options)
            .map_err(Error::InvalidInput)?;

        let started = Instant::now();
        let deadline = options.effective_deadline(started);
        let cancellation = options.cancellation.unwrap_or_default();

        debug!(?timing, "Attempting to acquire lease (will wait if necessary)");

        loop {
            let acquired = tokio::select! {
                biased;
                interruption = self.interruption(&cancellation, deadline) => {
                    return Err(Self::interrupted(resource_key, interruption, started));
                }
                result = self.try_acquire_once(resource_key, &timing) => result?,
            };

            if acquired {
                info!(waited = ?started.elapsed(), "Lease acquired");
                return Ok(());
            }

            tokio::select! {
                biased;
                interruption = self.interruption(&cancellation, deadline) => {
                    return Err(Self::interrupted(resource_key, interruption, started));
                }
                () = sleep(timing.poll_interval) => {}
            }
        }
    }

    async fn interruption(
        &self,
        cancellation: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Interruption {
        let deadline = async {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = cancellation.cancelled() => Interruption::Cancelled,
            () = self.inner.shutdown.cancelled() => Interruption::Cancelled,
            () = deadline => Interruption::DeadlineExceeded,
        }
    }

    fn interrupted(
        resource_key: &str,
        interruption: Interruption,
        started: Instant,
    ) -> Error<S::Error> {
        match interruption {
            Interruption::Cancelled => {
                debug!("Lease acquisition cancelled");
                Error::Cancelled {
                    resource_key: resource_key.to_string(),
                }
            }
            Interruption::DeadlineExceeded => {
                let waited = started.elapsed();
                debug!(?waited, "Gave up waiting for lease");
                Error::DeadlineExceeded {
                    resource_key: resource_key.to_string(),
                    waited,
                }
            }
        }
    }

    /// One conditional write. `Ok(false)` means the lease is held by another.
    async fn try_acquire_once(
        &self,
        resource_key: &str,
        timing: &LeaseTiming,
    ) -> Result<bool, Error<S::Error>> {
        let active = self
            .inner
            .leases
            .get(resource_key)
            .map(|handle| handle.state().is_active());
        match active {
            Some(true) => {
                return Err(Error::AlreadyHeld {
                    resource_key: resource_key.to_string(),
                });
            }
            Some(false) => {
                // refresher already gave up; the lease is not ours anymore
                self.inner.leases.remove(resource_key);
            }
            None => {}
        }

        let store = &self.inner.store;
        let retry = &self.inner.settings.retry;
        let storage_key = self.storage_key(resource_key);
        let owner_token = OwnerToken::mint();
        let now = self.inner.clock.now();
        let record = LeaseRecord::new(resource_key, owner_token, now + timing.lease_duration);

        let outcome = retry
            .run("put_if_absent_or_expired", || {
                store.put_if_absent_or_expired(&storage_key, &record, now)
            })
            .await?;

        match outcome {
            PutOutcome::Created => debug!(owner = %owner_token, "Lease record created"),
            PutOutcome::ReplacedExpired(previous) => info!(
                owner = %owner_token,
                previous_owner = %previous.owner_token(),
                expired_at = ?previous.expires_at(),
                "Took over expired lease"
            ),
            PutOutcome::ConditionFailed => {
                // a retried write may have landed on an earlier attempt
                let current = retry.run("get", || store.get(&storage_key)).await?;

                match current {
                    Some(current) if *current.owner_token() == owner_token => {
                        debug!(owner = %owner_token, "Lease record written by an earlier attempt");
                    }
                    Some(current) => {
                        debug!(
                            holder = %current.owner_token(),
                            expires_at = ?current.expires_at(),
                            "Lease held by another owner"
                        );
                        return Ok(false);
                    }
                    None => {
                        debug!("Lease released between write and read");
                        return Ok(false);
                    }
                }
            }
        }

        self.register(resource_key, storage_key, owner_token, timing);
        Ok(true)
    }

    fn register(
        &self,
        resource_key: &str,
        storage_key: String,
        owner_token: OwnerToken,
        timing: &LeaseTiming,
    ) {
        let cancel = self.inner.shutdown.child_token();
        let (state_tx, state_rx) = watch::channel(LeaseState::Active);

        let task = LeaseRefresher {
            store: self.inner.store.clone(),
            clock: Arc::clone(&self.inner.clock),
            storage_key,
            resource_key: resource_key.to_string(),
            owner_token,
            lease_duration: timing.lease_duration,
            refresh_interval: timing.refresh_interval,
            max_failures: self.inner.settings.max_refresh_failures,
            operation_timeout: self.inner.settings.retry.operation_timeout,
            cancel: cancel.clone(),
            state: state_tx,
        }
        .spawn();

        self.inner.leases.insert(
            resource_key.to_string(),
            LeaseHandle::new(resource_key.to_string(), owner_token, cancel, state_rx, task),
        );
    }

    #[instrument(skip(self), fields(key = %resource_key))]
    async fn try_acquire_lease(&self, resource_key: &str) -> Result<bool, Error<S::Error>> {
        Self::validate_key(resource_key)?;
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Cancelled {
                resource_key: resource_key.to_string(),
            });
        }

        let timing = self
            .inner
            .settings
            .timing(&AcquireOptions::default())
            .map_err(Error::InvalidConfig)?;

        let acquired = self.try_acquire_once(resource_key, &timing).await?;
        if acquired {
            info!("Lease acquired");
        } else {
            debug!("Lease is held by another owner");
        }

        Ok(acquired)
    }

    #[instrument(skip(self), fields(key = %resource_key))]
    async fn release_lease(&self, resource_key: &str) -> Result<ReleaseOutcome, Error<S::Error>> {
        Self::validate_key(resource_key)?;

        let Some((_, handle)) = self.inner.leases.remove(resource_key) else {
            debug!("No lease held; nothing to release");
            return Ok(ReleaseOutcome::NotHeld);
        };

        let owner_token = *handle.owner_token();
        let state = handle.state();
        handle.stop().await;

        let store = &self.inner.store;
        let storage_key = self.storage_key(resource_key);
        let outcome = self
            .inner
            .settings
            .retry
            .run("delete_if_owner_matches", || {
                store.delete_if_owner_matches(&storage_key, &owner_token)
            })
            .await?;

        match outcome {
            ConditionalOutcome::Applied => {
                info!(owner = %owner_token, "Lease released");
                Ok(ReleaseOutcome::Released)
            }
            ConditionalOutcome::ConditionFailed => {
                warn!(owner = %owner_token, ?state, "Lease was lost before release");
                Err(Error::LeaseLost {
                    resource_key: resource_key.to_string(),
                })
            }
        }
    }

    #[instrument(skip(self), fields(key = %resource_key))]
    async fn check_lease(&self, resource_key: &str) -> Result<LockStatus, Error<S::Error>> {
        Self::validate_key(resource_key)?;

        let store = &self.inner.store;
        let storage_key = self.storage_key(resource_key);
        let record = self
            .inner
            .settings
            .retry
            .run("get", || store.get(&storage_key))
            .await?;

        let Some(record) = record else {
            return Ok(LockStatus::Free);
        };

        if record.is_expired_at(self.inner.clock.now()) {
            return Ok(LockStatus::Expired(record.owner_token().to_string()));
        }

        let held_by_self = self
            .inner
            .leases
            .get(resource_key)
            .is_some_and(|handle| handle.owner_token() == record.owner_token());

        if held_by_self {
            Ok(LockStatus::HeldBySelf)
        } else {
            Ok(LockStatus::HeldByOther(record.owner_token().to_string()))
        }
    }

    /// Leases this manager currently tracks, including ones whose refresher
    /// has stopped but which have not been released yet.
    #[must_use]
    pub fn held_leases(&self) -> Vec<HeldLease> {
        self.inner
            .leases
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Refresher state of the lease on `resource_key`, if this manager holds
    /// it.
    #[must_use]
    pub fn lease_state(&self, resource_key: &str) -> Option<LeaseState> {
        self.inner
            .leases
            .get(resource_key)
            .map(|handle| handle.state())
    }

    /// Stops every refresher and forgets all held leases without deleting
    /// their records, which then expire on their own. Pending and future
    /// acquisitions fail with [`Error::Cancelled`].
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let keys: Vec<String> = self
            .inner
            .leases
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut stopped = 0;
        for key in keys {
            if let Some((_, handle)) = self.inner.leases.remove(&key) {
                handle.stop().await;
                stopped += 1;
            }
        }

        info!(stopped, scope = ?self.inner.scope, "Lease lock manager shut down");
    }
}

#[async_trait]
impl<S> LockManager for LeaseLockManager<S>
where
    S: LeaseStore,
{
    type Error = Error<S::Error>;

    async fn check(&self, resource_key: &str) -> Result<LockStatus, Self::Error> {
        self.check_lease(resource_key).await
    }

    async fn acquire(&self, resource_key: &str) -> Result<(), Self::Error> {
        self.acquire_with(resource_key, AcquireOptions::default())
            .await
    }

    async fn try_acquire(&self, resource_key: &str) -> Result<bool, Self::Error> {
        self.try_acquire_lease(resource_key).await
    }

    async fn release(&self, resource_key: &str) -> Result<ReleaseOutcome, Self::Error> {
        self.release_lease(resource_key).await
    }
}

macro_rules! impl_scoped_lock_manager {
    ($trait_name:ident) => {
        #[async_trait]
        impl<S> $trait_name for LeaseLockManager<S>
        where
            S: LeaseStore,
        {
            type Error = Error<S::Error>;
            type Scoped = Self;

            fn scope<N>(&self, scope: N) -> Self::Scoped
            where
                N: AsRef<str> + Send,
            {
                self.scoped(scope.as_ref())
            }
        }
    };
}

impl_scoped_lock_manager!(LockManager1);
impl_scoped_lock_manager!(LockManager2);
impl_scoped_lock_manager!(LockManager3);
