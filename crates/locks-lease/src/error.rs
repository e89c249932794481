use std::time::Duration;

use leasehold_lease_store::LeaseStoreError;
use leasehold_locks::LockManagerError;
use thiserror::Error;

/// Errors that can occur when using the lease lock manager.
///
/// `E` is the error type of the underlying lease store.
#[derive(Debug, Error)]
pub enum Error<E>
where
    E: LeaseStoreError,
{
    /// Rejected before touching the store (empty key, zero durations).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The manager configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// This manager already holds an active lease on the resource.
    #[error("lease on '{resource_key}' is already held by this manager")]
    AlreadyHeld {
        /// The resource.
        resource_key: String,
    },

    /// The caller's deadline passed while the lease was held by another.
    #[error("gave up on lease for '{resource_key}' after waiting {waited:?}")]
    DeadlineExceeded {
        /// The resource.
        resource_key: String,
        /// How long the acquisition waited.
        waited: Duration,
    },

    /// The caller (or the manager's shutdown) cancelled the acquisition.
    #[error("acquisition of lease on '{resource_key}' was cancelled")]
    Cancelled {
        /// The resource.
        resource_key: String,
    },

    /// The lease expired and was taken over, or deleted, before release.
    /// The critical section may have run unprotected.
    ///
    /// This can be a false positive: if a delete lands but its reply is lost,
    /// the retried delete finds no record and reports the lease as lost even
    /// though it was released cleanly.
    #[error("lease on '{resource_key}' was lost before it was released")]
    LeaseLost {
        /// The resource.
        resource_key: String,
    },

    /// The store failed with an error that is not worth retrying.
    #[error("lease store {operation} failed: {source}")]
    Store {
        /// The store operation.
        operation: &'static str,
        /// The store error.
        #[source]
        source: E,
    },

    /// Every attempt of a store operation timed out.
    #[error("lease store {operation} timed out after {attempts} attempts of {timeout:?}")]
    Timeout {
        /// The store operation.
        operation: &'static str,
        /// Number of attempts made before giving up.
        attempts: usize,
        /// Timeout applied to each attempt.
        timeout: Duration,
    },

    /// Maximum retry attempts exceeded.
    #[error("maximum retry attempts ({attempts}) exceeded for lease store {operation}: {source}")]
    MaxRetriesExceeded {
        /// The store operation.
        operation: &'static str,
        /// Number of attempts made.
        attempts: usize,
        /// The last store error.
        #[source]
        source: E,
    },
}

impl<E> Error<E>
where
    E: LeaseStoreError,
{
    /// Whether the error came from the store rather than from the caller or
    /// from lock contention.
    #[must_use]
    pub const fn is_store_fault(&self) -> bool {
        matches!(
            self,
            Self::Store { .. } | Self::Timeout { .. } | Self::MaxRetriesExceeded { .. }
        )
    }
}

impl<E> LockManagerError for Error<E> where E: LeaseStoreError {}
