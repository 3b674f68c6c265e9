//! At-most-once-per-interval gate for noisy warnings.
//!
//! The gateway warns when tablets disagree on their default connection
//! collation; that condition persists for the lifetime of a misconfigured
//! tablet, so the warning must not fire per query.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Lets an event through at most once per `min_interval`.
pub struct EventThrottle {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl EventThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Returns true when the caller should emit the event now. The throttle
    /// window starts at the first allowed event.
    pub fn allow(&self) -> bool {
        let mut last = self.last.lock();
        match *last {
            Some(at) if at.elapsed() < self.min_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}
