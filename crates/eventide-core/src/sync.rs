//! Synchronization primitives

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Counter of in-flight work that callers can wait to reach zero
///
/// Tracks in-flight tasks of a runtime so shutdown can drain them.
pub struct PendingCounter {
    /// Current count
    count: Mutex<usize>,
    /// Signalled whenever the count drops to zero
    idle: Condvar,
}

impl PendingCounter {
    /// Create a counter at zero
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    /// Add one unit of work, returning the new count
    pub fn increment(&self) -> usize {
        let mut count = self.count.lock();
        *count += 1;
        *count
    }

    /// Remove one unit of work, returning the new count
    pub fn decrement(&self) -> usize {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
        *count
    }

    /// Current count
    pub fn get(&self) -> usize {
        *self.count.lock()
    }

    /// Block until the count reaches zero or the timeout elapses.
    ///
    /// Returns true if the counter is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

impl Default for PendingCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counter_basic() {
        let counter = PendingCounter::new();
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.decrement(), 1);
        assert_eq!(counter.get(), 1);
        assert_eq!(counter.decrement(), 0);

        // Never goes negative
        assert_eq!(counter.decrement(), 0);
    }

    #[test]
    fn test_wait_idle_immediate() {
        let counter = PendingCounter::new();
        assert!(counter.wait_idle(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_idle_timeout() {
        let counter = PendingCounter::new();
        counter.increment();
        assert!(!counter.wait_idle(Duration::from_millis(20)));
    }

    #[test]
    fn test_wait_idle_wakes_on_zero() {
        let counter = Arc::new(PendingCounter::new());
        counter.increment();

        let remote = counter.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.decrement();
        });

        assert!(counter.wait_idle(Duration::from_secs(5)));
        handle.join().unwrap();
    }
}
