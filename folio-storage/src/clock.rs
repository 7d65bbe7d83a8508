//! Strictly increasing timestamps for access ordering.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use folio_core::Timestamp;

/// Hands out microsecond timestamps that never repeat and never go backwards
/// within one cache instance, even when the wall clock does.
///
/// LRU ordering keys on `accessed_at`, so two writes in the same microsecond
/// would otherwise tie and fall back to the size/key tie-breakers.
#[derive(Debug)]
pub struct MonotonicClock {
    last_micros: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            last_micros: AtomicI64::new(i64::MIN),
        }
    }

    /// Start no earlier than `floor`, e.g. the newest timestamp found on disk.
    pub fn starting_after(floor: Timestamp) -> Self {
        Self {
            last_micros: AtomicI64::new(floor.timestamp_micros()),
        }
    }

    pub fn now(&self) -> Timestamp {
        let wall = Utc::now().timestamp_micros();
        let mut previous = self.last_micros.load(Ordering::Relaxed);
        loop {
            let next = wall.max(previous.saturating_add(1));
            match self.last_micros.compare_exchange_weak(
                previous,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return DateTime::from_timestamp_micros(next).unwrap_or_else(Utc::now),
                Err(actual) => previous = actual,
            }
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
