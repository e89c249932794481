use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime};

use tokio::time::Instant;

/// Source of wall-clock time for computing and comparing lease expiries.
pub trait Clock: Debug + Send + Sync + 'static {
    /// The current wall-clock time.
    fn now(&self) -> SystemTime;
}

/// The operating system's wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Wall clock driven by tokio's clock, for tests and simulations.
///
/// Time starts at the wall-clock time of construction and advances with
/// `tokio::time`, so a runtime with paused time (`start_paused = true`)
/// moves leases forward deterministically. An adjustable offset simulates
/// skew between processes. Clones share the offset.
#[derive(Clone, Debug)]
pub struct SimulatedClock {
    origin_wall: SystemTime,
    origin: Instant,
    offset_ms: Arc<AtomicI64>,
}

impl SimulatedClock {
    /// Creates a clock anchored at the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin_wall: SystemTime::now(),
            origin: Instant::now(),
            offset_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Creates a clock sharing this clock's origin but with its own offset,
    /// i.e. another process whose clock is `skew_ms` ahead (or behind, if
    /// negative).
    #[must_use]
    pub fn skewed(&self, skew_ms: i64) -> Self {
        Self {
            origin_wall: self.origin_wall,
            origin: self.origin,
            offset_ms: Arc::new(AtomicI64::new(self.offset_ms() + skew_ms)),
        }
    }

    /// Jumps the clock forward without any tokio time passing.
    pub fn advance(&self, by: Duration) {
        let by_ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.offset_ms.fetch_add(by_ms, Ordering::SeqCst);
    }

    /// Current offset from tokio time in milliseconds.
    #[must_use]
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> SystemTime {
        let elapsed = self.origin.elapsed();
        let offset = self.offset_ms();
        let base = self.origin_wall + elapsed;

        if offset >= 0 {
            base + Duration::from_millis(offset.unsigned_abs())
        } else {
            base - Duration::from_millis(offset.unsigned_abs())
        }
    }
}
