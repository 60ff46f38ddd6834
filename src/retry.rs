//! Bounded retry schedule for broker write attempts.
//!
//! Stop modifications get a fixed short ladder of immediate retries before
//! falling back to the durable catch-up queue. The schedule is injectable so
//! tests can run the full ladder without sleeping.

use std::time::Duration;

/// Fixed delays between retry attempts. An empty schedule means a single
/// attempt with no retries.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(5),
            ],
        }
    }
}

impl RetrySchedule {
    /// Same number of attempts as the default schedule but with zero delays.
    pub fn immediate() -> Self {
        Self {
            delays: vec![Duration::ZERO; 3],
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self { delays: Vec::new() }
    }

    /// Total attempts including the initial one.
    pub fn attempts(&self) -> usize {
        self.delays.len() + 1
    }

    /// Delay to sleep before retry attempt `retry` (0-based). None when the
    /// schedule is exhausted.
    pub fn delay_before_retry(&self, retry: usize) -> Option<Duration> {
        self.delays.get(retry).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ladder() {
        let schedule = RetrySchedule::default();
        assert_eq!(schedule.attempts(), 4);
        assert_eq!(schedule.delay_before_retry(0), Some(Duration::from_secs(1)));
        assert_eq!(schedule.delay_before_retry(1), Some(Duration::from_secs(3)));
        assert_eq!(schedule.delay_before_retry(2), Some(Duration::from_secs(5)));
        assert_eq!(schedule.delay_before_retry(3), None);
    }

    #[test]
    fn test_none_is_single_attempt() {
        let schedule = RetrySchedule::none();
        assert_eq!(schedule.attempts(), 1);
        assert_eq!(schedule.delay_before_retry(0), None);
    }

    #[test]
    fn test_immediate_keeps_attempt_count() {
        let schedule = RetrySchedule::immediate();
        assert_eq!(schedule.attempts(), RetrySchedule::default().attempts());
        assert_eq!(schedule.delay_before_retry(0), Some(Duration::ZERO));
    }
}
