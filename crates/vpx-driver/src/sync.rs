//! Bounded-wait synchronization primitives.
//!
//! The boot sequencer blocks on a semaphore the interrupt path posts; how
//! a bounded block is implemented varies per host platform, so the waiting
//! side depends only on the [`BoundedWait`] trait. [`CondvarSemaphore`] is
//! the std implementation used on Linux hosts and in the simulator.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Result, VpxError};

/// A counting semaphore with a bounded-wait contract.
///
/// `post` is callable from the interrupt-service path; `wait` blocks an
/// ordinary worker thread until a permit arrives or the deadline passes.
pub trait BoundedWait: Send + Sync {
    /// Release one permit, waking a waiter if any.
    fn post(&self);

    /// Consume one permit, blocking at most `timeout`.
    ///
    /// # Errors
    ///
    /// [`VpxError::TimedOut`] when the deadline passes without a permit.
    /// Implementations whose blocking wait is interruptible return
    /// [`VpxError::Again`]; the caller retries. The condvar
    /// implementation never does.
    fn wait(&self, what: &'static str, timeout: Duration) -> Result<()>;

    /// Drop any pending permits. Called once per boot attempt so a stale
    /// post from a torn-down attempt cannot satisfy the next wait.
    fn drain(&self);
}

/// Std-based semaphore: a permit count under a mutex plus a condvar.
#[derive(Debug, Default)]
pub struct CondvarSemaphore {
    permits: Mutex<u32>,
    cv: Condvar,
}

impl CondvarSemaphore {
    /// Create a semaphore with no permits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BoundedWait for CondvarSemaphore {
    fn post(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        *permits += 1;
        self.cv.notify_one();
    }

    fn wait(&self, what: &'static str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if *permits > 0 {
                *permits -= 1;
                return Ok(());
            }
            let now = Instant::now();
            let Some(remaining) = deadline.checked_duration_since(now).filter(|d| !d.is_zero())
            else {
                return Err(VpxError::TimedOut {
                    what,
                    duration_ms: timeout.as_millis() as u64,
                    checkpoint: 0,
                });
            };
            let (guard, _timed_out) = self
                .cv
                .wait_timeout(permits, remaining)
                .unwrap_or_else(|e| e.into_inner());
            permits = guard;
        }
    }

    fn drain(&self) {
        *self.permits.lock().unwrap_or_else(|e| e.into_inner()) = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn post_then_wait_is_immediate() {
        let sem = CondvarSemaphore::new();
        sem.post();
        sem.wait("test", Duration::from_millis(1)).unwrap();
    }

    #[test]
    fn wait_times_out_without_a_post() {
        let sem = CondvarSemaphore::new();
        let err = sem.wait("test", Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, VpxError::TimedOut { what: "test", .. }));
    }

    #[test]
    fn post_from_another_thread_wakes_the_waiter() {
        let sem = Arc::new(CondvarSemaphore::new());
        let poster = Arc::clone(&sem);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            poster.post();
        });
        sem.wait("test", Duration::from_secs(5)).unwrap();
        t.join().unwrap();
    }

    #[test]
    fn drain_discards_stale_permits() {
        let sem = CondvarSemaphore::new();
        sem.post();
        sem.drain();
        assert!(sem.wait("test", Duration::from_millis(5)).is_err());
    }
}
