use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Manual-reset "work arrived" event shared by every producer and the driver.
///
/// A notification that lands while the driver is busy is remembered, so the
/// next wait returns immediately instead of sleeping through it.
#[derive(Debug, Default)]
pub struct WorkSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl WorkSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_one();
    }

    /// Block until notified, then reset
    pub fn wait(&self) {
        let mut pending = self.pending.lock();
        while !*pending {
            self.cond.wait(&mut pending);
        }
        *pending = false;
    }

    /// Block until notified or the timeout elapses, then reset.
    /// Returns true when woken by a notification.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        let notified = *pending;
        *pending = false;
        notified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_notification_before_wait_is_not_lost() {
        let signal = WorkSignal::new();
        signal.notify();
        assert!(signal.wait_timeout(Duration::from_secs(5)));
        // consumed
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_wakes_on_notify_from_other_thread() {
        let signal = Arc::new(WorkSignal::new());
        let producer = Arc::clone(&signal);
        let started = Instant::now();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.notify();
        });

        signal.wait();
        handle.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
