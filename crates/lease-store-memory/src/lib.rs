//! In-memory (single process) implementation of the lease store for local
//! development and tests. Managers sharing one `MemoryLeaseStore` behave like
//! independent processes sharing a remote store.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use leasehold_lease_store::{ConditionalOutcome, LeaseRecord, LeaseStore, OwnerToken, PutOutcome};
use tokio::sync::Mutex;
use tracing::debug;

/// Kind of failure injected into store operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Fails with [`Error::Unavailable`], which callers may retry.
    Unavailable,

    /// Fails with [`Error::Rejected`], which callers must not retry.
    Rejected,

    /// Applies the operation, then fails with [`Error::Unavailable`] as if the
    /// reply was lost on the way back.
    ReplyLost,
}

impl Fault {
    const fn into_error(self) -> Error {
        match self {
            Self::Unavailable | Self::ReplyLost => Error::Unavailable,
            Self::Rejected => Error::Rejected,
        }
    }
}

#[derive(Debug, Default)]
struct FaultState {
    pending: usize,
    pending_fault: Option<Fault>,
    outage: Option<Fault>,
    latency: Duration,
}

impl FaultState {
    fn take(&mut self) -> Option<Fault> {
        if self.outage.is_some() {
            return self.outage;
        }

        if self.pending > 0 {
            self.pending -= 1;
            let fault = self.pending_fault;
            if self.pending == 0 {
                self.pending_fault = None;
            }
            return fault;
        }

        None
    }
}

/// In-memory lease store.
#[derive(Clone, Debug, Default)]
pub struct MemoryLeaseStore {
    map: Arc<Mutex<HashMap<String, Bytes>>>,
    faults: Arc<Mutex<FaultState>>,
}

impl MemoryLeaseStore {
    /// Creates a new, empty `MemoryLeaseStore`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: Arc::new(Mutex::new(HashMap::new())),
            faults: Arc::new(Mutex::new(FaultState::default())),
        }
    }

    /// Makes the next `count` operations fail with `fault`.
    pub async fn fail_next(&self, count: usize, fault: Fault) {
        let mut faults = self.faults.lock().await;
        faults.pending = count;
        faults.pending_fault = Some(fault);
    }

    /// Makes every operation fail with `fault` until called again with `None`.
    pub async fn set_outage(&self, fault: Option<Fault>) {
        self.faults.lock().await.outage = fault;
    }

    /// Delays every operation by `latency` before it is applied.
    pub async fn set_latency(&self, latency: Duration) {
        self.faults.lock().await.latency = latency;
    }

    /// Stores arbitrary bytes under `key`, bypassing every condition.
    pub async fn raw_insert(&self, key: impl Into<String>, bytes: Bytes) {
        self.map.lock().await.insert(key.into(), bytes);
    }

    /// Keys currently stored.
    pub async fn keys(&self) -> Vec<String> {
        self.map.lock().await.keys().cloned().collect()
    }

    /// Injects the next fault and latency ahead of an operation. Returns
    /// whether the reply to the operation is to be lost once it is applied.
    async fn simulate_remote(&self, operation: &'static str) -> Result<bool, Error> {
        let (fault, latency) = {
            let mut faults = self.faults.lock().await;
            (faults.take(), faults.latency)
        };

        let reply_lost = match fault {
            Some(Fault::ReplyLost) => {
                debug!(operation, "Losing reply of memory lease store operation");
                true
            }
            Some(fault) => {
                debug!(operation, ?fault, "Injecting memory lease store fault");
                return Err(fault.into_error());
            }
            None => false,
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        Ok(reply_lost)
    }

    fn reply<T>(reply_lost: bool, result: Result<T, Error>) -> Result<T, Error> {
        match result {
            Ok(_) if reply_lost => Err(Fault::ReplyLost.into_error()),
            result => result,
        }
    }

    async fn apply_put(
        &self,
        key: &str,
        record: &LeaseRecord,
        now: SystemTime,
    ) -> Result<PutOutcome, Error> {
        let mut map = self.map.lock().await;
        let outcome = match Self::decode(map.get(key))? {
            None => PutOutcome::Created,
            Some(existing) if existing.is_expired_at(now) => PutOutcome::ReplacedExpired(existing),
            Some(_) => return Ok(PutOutcome::ConditionFailed),
        };

        map.insert(key.to_string(), record.encode()?);
        Ok(outcome)
    }

    async fn apply_update(
        &self,
        key: &str,
        new_expiry: SystemTime,
        owner: &OwnerToken,
    ) -> Result<ConditionalOutcome, Error> {
        let mut map = self.map.lock().await;
        match Self::decode(map.get(key))? {
            Some(existing) if existing.owner_token() == owner => {
                map.insert(key.to_string(), existing.with_expiry(new_expiry).encode()?);
                Ok(ConditionalOutcome::Applied)
            }
            _ => Ok(ConditionalOutcome::ConditionFailed),
        }
    }

    async fn apply_delete(&self, key: &str, owner: &OwnerToken) -> Result<ConditionalOutcome, Error> {
        let mut map = self.map.lock().await;
        match Self::decode(map.get(key))? {
            Some(existing) if existing.owner_token() == owner => {
                map.remove(key);
                Ok(ConditionalOutcome::Applied)
            }
            _ => Ok(ConditionalOutcome::ConditionFailed),
        }
    }

    fn decode(bytes: Option<&Bytes>) -> Result<Option<LeaseRecord>, Error> {
        bytes
            .map(|bytes| LeaseRecord::decode(bytes))
            .transpose()
            .map_err(Error::from)
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    type Error = Error;

    async fn put_if_absent_or_expired(
        &self,
        key: &str,
        record: &LeaseRecord,
        now: SystemTime,
    ) -> Result<PutOutcome, Self::Error> {
        let reply_lost = self.simulate_remote("put_if_absent_or_expired").await?;
        Self::reply(reply_lost, self.apply_put(key, record, now).await)
    }

    async fn update_if_owner_matches(
        &self,
        key: &str,
        new_expiry: SystemTime,
        owner: &OwnerToken,
    ) -> Result<ConditionalOutcome, Self::Error> {
        let reply_lost = self.simulate_remote("update_if_owner_matches").await?;
        Self::reply(reply_lost, self.apply_update(key, new_expiry, owner).await)
    }

    async fn delete_if_owner_matches(
        &self,
        key: &str,
        owner: &OwnerToken,
    ) -> Result<ConditionalOutcome, Self::Error> {
        let reply_lost = self.simulate_remote("delete_if_owner_matches").await?;
        Self::reply(reply_lost, self.apply_delete(key, owner).await)
    }

    async fn get(&self, key: &str) -> Result<Option<LeaseRecord>, Self::Error> {
        let reply_lost = self.simulate_remote("get").await?;
        let map = self.map.lock().await;
        Self::reply(reply_lost, Self::decode(map.get(key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use leasehold_lease_store::LeaseStoreError;
    use std::time::UNIX_EPOCH;

    const KEY: &str = "locks/example.com.lock";

    fn at(ms: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(ms)
    }

    fn record(owner: OwnerToken, expires_at_ms: u64) -> LeaseRecord {
        LeaseRecord::from_parts("example.com", owner, expires_at_ms)
    }

    #[tokio::test]
    async fn test_put_creates_when_absent() {
        let store = MemoryLeaseStore::new();
        let owner = OwnerToken::mint();

        let outcome = store
            .put_if_absent_or_expired(KEY, &record(owner, 5_000), at(1_000))
            .await
            .unwrap();

        assert_eq!(outcome, PutOutcome::Created);
        assert_eq!(store.get(KEY).await.unwrap(), Some(record(owner, 5_000)));
    }

    #[tokio::test]
    async fn test_put_fails_while_lease_valid() {
        let store = MemoryLeaseStore::new();
        let first = OwnerToken::mint();
        let second = OwnerToken::mint();

        store
            .put_if_absent_or_expired(KEY, &record(first, 5_000), at(1_000))
            .await
            .unwrap();

        // Expiry equal to now is still a valid lease.
        let outcome = store
            .put_if_absent_or_expired(KEY, &record(second, 9_000), at(5_000))
            .await
            .unwrap();

        assert_eq!(outcome, PutOutcome::ConditionFailed);
        assert_eq!(store.get(KEY).await.unwrap(), Some(record(first, 5_000)));
    }

    #[tokio::test]
    async fn test_put_replaces_expired() {
        let store = MemoryLeaseStore::new();
        let first = OwnerToken::mint();
        let second = OwnerToken::mint();

        store
            .put_if_absent_or_expired(KEY, &record(first, 5_000), at(1_000))
            .await
            .unwrap();

        let outcome = store
            .put_if_absent_or_expired(KEY, &record(second, 9_000), at(5_001))
            .await
            .unwrap();

        assert_eq!(outcome, PutOutcome::ReplacedExpired(record(first, 5_000)));
        assert_eq!(store.get(KEY).await.unwrap(), Some(record(second, 9_000)));
    }

    #[tokio::test]
    async fn test_update_and_delete_are_fenced() {
        let store = MemoryLeaseStore::new();
        let owner = OwnerToken::mint();
        let intruder = OwnerToken::mint();

        store
            .put_if_absent_or_expired(KEY, &record(owner, 5_000), at(1_000))
            .await
            .unwrap();

        assert_eq!(
            store.update_if_owner_matches(KEY, at(8_000), &intruder).await.unwrap(),
            ConditionalOutcome::ConditionFailed
        );
        assert_eq!(
            store.delete_if_owner_matches(KEY, &intruder).await.unwrap(),
            ConditionalOutcome::ConditionFailed
        );
        assert_eq!(store.get(KEY).await.unwrap(), Some(record(owner, 5_000)));

        assert_eq!(
            store.update_if_owner_matches(KEY, at(8_000), &owner).await.unwrap(),
            ConditionalOutcome::Applied
        );
        assert_eq!(store.get(KEY).await.unwrap(), Some(record(owner, 8_000)));

        assert_eq!(
            store.delete_if_owner_matches(KEY, &owner).await.unwrap(),
            ConditionalOutcome::Applied
        );
        assert_eq!(store.get(KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_conditional_ops_on_missing_record() {
        let store = MemoryLeaseStore::new();
        let owner = OwnerToken::mint();

        assert_eq!(
            store.update_if_owner_matches(KEY, at(8_000), &owner).await.unwrap(),
            ConditionalOutcome::ConditionFailed
        );
        assert_eq!(
            store.delete_if_owner_matches(KEY, &owner).await.unwrap(),
            ConditionalOutcome::ConditionFailed
        );
        // A refresh must not resurrect a deleted record.
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_fail_next_then_recover() {
        let store = MemoryLeaseStore::new();
        store.fail_next(2, Fault::Unavailable).await;

        let first = store.get(KEY).await.unwrap_err();
        assert!(first.is_retriable());
        assert_matches!(store.get(KEY).await, Err(Error::Unavailable));
        assert_matches!(store.get(KEY).await, Ok(None));
    }

    #[tokio::test]
    async fn test_outage_until_cleared() {
        let store = MemoryLeaseStore::new();
        store.set_outage(Some(Fault::Rejected)).await;

        for _ in 0..3 {
            let err = store.get(KEY).await.unwrap_err();
            assert_matches!(err, Error::Rejected);
            assert!(!err.is_retriable());
        }

        store.set_outage(None).await;
        assert_matches!(store.get(KEY).await, Ok(None));
    }

    #[tokio::test]
    async fn test_corrupt_record_is_not_overwritten() {
        let store = MemoryLeaseStore::new();
        store.raw_insert(KEY, Bytes::from_static(b"garbage")).await;

        let err = store
            .put_if_absent_or_expired(KEY, &record(OwnerToken::mint(), 5_000), at(1_000))
            .await
            .unwrap_err();

        assert_matches!(err, Error::Codec(_));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_reply_lost_after_write_applied() {
        let store = MemoryLeaseStore::new();
        let owner = OwnerToken::mint();
        store.fail_next(1, Fault::ReplyLost).await;

        let err = store
            .put_if_absent_or_expired(KEY, &record(owner, 5_000), at(1_000))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Unavailable);
        assert!(err.is_retriable());

        // the write landed, so a retry sees its own record
        assert_eq!(store.get(KEY).await.unwrap(), Some(record(owner, 5_000)));
        assert_eq!(
            store
                .put_if_absent_or_expired(KEY, &record(owner, 5_000), at(1_000))
                .await
                .unwrap(),
            PutOutcome::ConditionFailed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_delays_operations() {
        let store = MemoryLeaseStore::new();
        store.set_latency(Duration::from_millis(300)).await;

        let started = tokio::time::Instant::now();
        store.get(KEY).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
