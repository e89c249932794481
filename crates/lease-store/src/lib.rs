//! Conditional-write key-value contract that lease locks are built on, plus
//! the persisted lease record and the clock used to compute expiries.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod clock;
mod error;
mod record;

pub use clock::{Clock, SimulatedClock, SystemClock};
pub use error::CodecError;
pub use record::{LeaseRecord, OwnerToken, system_time_to_millis};

use std::error::Error;
use std::fmt::Debug;
use std::time::SystemTime;

use async_trait::async_trait;

/// Marker trait for `LeaseStore` errors.
pub trait LeaseStoreError: Debug + Error + Send + Sync + 'static {
    /// Whether the failure is transient (network, throttling, timeout) and the
    /// same operation may succeed if issued again.
    fn is_retriable(&self) -> bool;
}

/// Outcome of [`LeaseStore::put_if_absent_or_expired`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// No record existed; the new one was written.
    Created,

    /// An expired record existed and was overwritten. Carries the record that
    /// was replaced.
    ReplacedExpired(LeaseRecord),

    /// A record with a lease that is still valid exists. Nothing was written.
    ConditionFailed,
}

/// Outcome of an owner-fenced update or delete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionalOutcome {
    /// The stored owner matched and the operation was applied.
    Applied,

    /// The record is gone or belongs to another owner. Nothing was changed.
    ConditionFailed,
}

/// A key-value store exposing the atomic conditional operations a lease lock
/// needs. Each method must be a single server-side conditional operation;
/// emulating them with a read followed by a write breaks mutual exclusion.
///
/// Keys are storage keys as produced by [`LeaseRecord::storage_key`],
/// optionally prefixed by a scope.
#[async_trait]
pub trait LeaseStore: Clone + Send + Sync + 'static {
    /// The error type for store operations.
    type Error: LeaseStoreError;

    /// Writes `record` under `key` if no record exists or the existing one
    /// expired before `now`.
    async fn put_if_absent_or_expired(
        &self,
        key: &str,
        record: &LeaseRecord,
        now: SystemTime,
    ) -> Result<PutOutcome, Self::Error>;

    /// Moves the expiry of the record under `key` to `new_expiry` if its owner
    /// is `owner`.
    async fn update_if_owner_matches(
        &self,
        key: &str,
        new_expiry: SystemTime,
        owner: &OwnerToken,
    ) -> Result<ConditionalOutcome, Self::Error>;

    /// Deletes the record under `key` if its owner is `owner`.
    async fn delete_if_owner_matches(
        &self,
        key: &str,
        owner: &OwnerToken,
    ) -> Result<ConditionalOutcome, Self::Error>;

    /// Reads the record under `key` with read-after-write consistency.
    async fn get(&self, key: &str) -> Result<Option<LeaseRecord>, Self::Error>;
}
