//! Abstract interface for managing system-global distributed locks.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;

/// Marker trait for `LockManager` errors
pub trait LockManagerError: Debug + Error + Send + Sync + 'static {}

/// Represents the current status of a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// No lock record exists for the resource.
    Free,

    /// A lock record exists but its lease has run out. The String identifies
    /// the abandoned owner. Anyone may take the lock over.
    Expired(String),

    /// The lock is held by another instance, identified by the String.
    HeldByOther(String),

    /// The lock is held by the current instance/manager.
    HeldBySelf,
}

/// Result of releasing a lock that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The lock was held by this manager and has been released.
    Released,

    /// This manager held no lock for the resource. Nothing was changed.
    NotHeld,
}

/// A trait representing a distributed lock manager with asynchronous operations.
///
/// Locks are leases: they are kept alive in the background while held and
/// expire on their own if the holder disappears without releasing.
#[async_trait]
pub trait LockManager: Clone + Send + Sync + 'static {
    /// The error type for lock operations.
    type Error: LockManagerError;

    /// Checks the status of a lock.
    ///
    /// # Arguments
    /// * `resource_key`: The unique identifier for the resource.
    async fn check(&self, resource_key: &str) -> Result<LockStatus, Self::Error>;

    /// Acquires a lock, waiting until it becomes available.
    ///
    /// Dropping the returned future abandons the attempt.
    ///
    /// # Arguments
    /// * `resource_key`: A unique identifier for the resource to be locked.
    async fn acquire(&self, resource_key: &str) -> Result<(), Self::Error>;

    /// Attempts to acquire a lock without waiting.
    ///
    /// Returns `Ok(true)` if the lock was acquired and `Ok(false)` if it is
    /// currently held by another.
    ///
    /// # Arguments
    /// * `resource_key`: A unique identifier for the resource to be locked.
    async fn try_acquire(&self, resource_key: &str) -> Result<bool, Self::Error>;

    /// Releases a lock previously acquired through this manager.
    ///
    /// Releasing a resource this manager does not hold is not an error and
    /// yields [`ReleaseOutcome::NotHeld`].
    ///
    /// # Arguments
    /// * `resource_key`: The identifier passed to `acquire`.
    async fn release(&self, resource_key: &str) -> Result<ReleaseOutcome, Self::Error>;
}

macro_rules! define_scoped_lock_manager {
    ($name:ident, $parent:ident, $doc:expr_2021) => {
        #[async_trait]
        #[doc = $doc]
        pub trait $name
        where
            Self: Clone + Send + Sync + 'static,
        {
            /// The error type for the lock manager.
            type Error: LockManagerError;

            /// The scoped lock manager type.
            type Scoped: $parent<Error = Self::Error>;

            /// Creates a scoped lock manager.
            fn scope<S>(&self, scope: S) -> Self::Scoped
            where
                S: AsRef<str> + Send;
        }
    };
}

define_scoped_lock_manager!(
    LockManager1,
    LockManager,
    "A trait representing a single-scoped lock manager with asynchronous operations."
);
define_scoped_lock_manager!(
    LockManager2,
    LockManager1,
    "A trait representing a double-scoped lock manager with asynchronous operations."
);
define_scoped_lock_manager!(
    LockManager3,
    LockManager2,
    "A trait representing a triple-scoped lock manager with asynchronous operations."
);
