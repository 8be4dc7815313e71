//! Counting semaphore with bounded waits
//!
//! The decoder and collector threads park on a semaphore with a timeout so a
//! missed signal costs at most one wake period. Built on a mutex-guarded
//! counter and a condvar; permits accumulate, so signals sent while the
//! waiter is busy are not lost.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Counting semaphore supporting timed waits
pub struct Semaphore {
    permits: Mutex<u64>,
    condvar: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            permits: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// Add one permit and wake one waiter
    pub fn signal(&self) {
        let mut permits = self.permits.lock().unwrap();
        *permits += 1;
        self.condvar.notify_one();
    }

    /// Take one permit, waiting at most `timeout`
    ///
    /// Returns true if a permit was consumed, false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock().unwrap();

        while *permits == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self
                .condvar
                .wait_timeout(permits, deadline - now)
                .unwrap();
            permits = guard;
            if result.timed_out() && *permits == 0 {
                return false;
            }
        }

        *permits -= 1;
        true
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}
