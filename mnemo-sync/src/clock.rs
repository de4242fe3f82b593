//! Millisecond timestamps for last-writer-wins.
//!
//! Wall-clock time is not monotonic and two writes can land in the same
//! millisecond, which the strictly-greater LWW rule would treat as stale.
//! `LwwClock` hands out epoch-ms values that never repeat and never fall
//! behind a timestamp already observed from a peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Default)]
pub struct LwwClock {
    last: AtomicU64,
}

impl LwwClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp: `max(wall clock, last + 1)`.
    pub fn now(&self) -> u64 {
        let wall = epoch_ms();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }

    /// Record a timestamp seen from elsewhere so later local writes beat it.
    pub fn observe(&self, timestamp: u64) {
        self.last.fetch_max(timestamp, Ordering::AcqRel);
    }
}
