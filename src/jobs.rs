//! Single-flight guard for scheduled jobs.
//!
//! Reconciliation and trailing-stop reassessment must never run concurrently
//! with themselves. Each job holds an [`InFlightFlag`]; a second trigger while
//! the first still runs is refused. A watchdog clears the flag if a run has
//! been stuck past its deadline, so one hung broker call cannot wedge the
//! scheduler forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

const DEFAULT_MAX_RUNTIME: Duration = Duration::from_secs(300);

pub struct InFlightFlag {
    name: &'static str,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    max_runtime: Duration,
}

/// RAII guard; dropping it marks the job as finished.
pub struct InFlightGuard<'a> {
    flag: &'a InFlightFlag,
}

impl InFlightFlag {
    pub fn new(name: &'static str) -> Self {
        Self::with_max_runtime(name, DEFAULT_MAX_RUNTIME)
    }

    pub fn with_max_runtime(name: &'static str, max_runtime: Duration) -> Self {
        Self {
            name,
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            max_runtime,
        }
    }

    /// Try to claim the job. Returns None when a run is already in flight.
    pub fn try_acquire(&self) -> Option<InFlightGuard<'_>> {
        self.reset_if_stuck();

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }

        if let Ok(mut started) = self.started_at.lock() {
            *started = Some(Instant::now());
        }

        Some(InFlightGuard { flag: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Force-clear the flag when a run has been stuck past the deadline.
    fn reset_if_stuck(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let stuck = self
            .started_at
            .lock()
            .ok()
            .and_then(|s| *s)
            .map(|started| started.elapsed() > self.max_runtime)
            .unwrap_or(false);

        if stuck {
            warn!(
                job = self.name,
                max_runtime_secs = self.max_runtime.as_secs(),
                "Job exceeded maximum runtime, clearing stuck in-flight flag"
            );
            self.running.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.running.store(false, Ordering::SeqCst);
        if let Ok(mut started) = self.flag.started_at.lock() {
            *started = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_refused() {
        let flag = InFlightFlag::new("test_job");

        let guard = flag.try_acquire();
        assert!(guard.is_some());
        assert!(flag.try_acquire().is_none());

        drop(guard);
        assert!(flag.try_acquire().is_some());
    }

    #[test]
    fn test_guard_drop_clears_flag() {
        let flag = InFlightFlag::new("test_job");
        {
            let _guard = flag.try_acquire().unwrap();
            assert!(flag.is_running());
        }
        assert!(!flag.is_running());
    }

    #[test]
    fn test_stuck_flag_reset() {
        let flag = InFlightFlag::with_max_runtime("test_job", Duration::ZERO);

        let guard = flag.try_acquire().unwrap();
        // Leak the guard to simulate a hung run
        std::mem::forget(guard);
        assert!(flag.is_running());

        // With a zero deadline the next acquire clears the stuck flag
        assert!(flag.try_acquire().is_some());
    }
}
