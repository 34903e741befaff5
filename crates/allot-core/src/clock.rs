use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

/// Source of "now" for all loops.
///
/// Production code uses [`Clock::system`]. Tests use [`Clock::test`], which
/// starts at the UNIX epoch and advances by one second on every call, so
/// every timestamp written in a test run is deterministic.
#[derive(Clone)]
pub struct Clock(ClockInner);

#[derive(Clone)]
enum ClockInner {
    System,
    Test(Arc<AtomicI64>),
}

impl Clock {
    pub fn system() -> Self {
        Clock(ClockInner::System)
    }

    /// A deterministic clock for tests: the first call returns t=0 s
    /// (1970-01-01T00:00:00Z), each subsequent call one second later.
    pub fn test() -> Self {
        Clock(ClockInner::Test(Arc::new(AtomicI64::new(0))))
    }

    pub fn now(&self) -> DateTime<Utc> {
        match &self.0 {
            ClockInner::System => Utc::now(),
            ClockInner::Test(next) => {
                let secs = next.fetch_add(1, Ordering::SeqCst);
                DateTime::UNIX_EPOCH + TimeDelta::seconds(secs)
            }
        }
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            ClockInner::System => f.write_str("Clock::System"),
            ClockInner::Test(_) => f.write_str("Clock::Test"),
        }
    }
}

/// The UNIX epoch, used as the "sorts after new work, retried eventually"
/// sentinel for `scraped_at` after a failed first scrape.
pub fn unix_epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}
