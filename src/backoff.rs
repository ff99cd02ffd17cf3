use std::time::Duration;

/// Interval used for the first poll of a job.
pub const INITIAL_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Ceiling the doubled interval never exceeds.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Consecutive connection errors tolerated before the job is abandoned.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Poll cadence shared by every backend that polls for job state.
///
/// Starts fast, doubles on each connection-level error up to the cap, and
/// resets as soon as a poll succeeds. After [`MAX_CONSECUTIVE_ERRORS`]
/// consecutive failures the loop must stop and report the job as failed —
/// it never runs forever against a dead server.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    interval: Duration,
    max_interval: Duration,
    consecutive_errors: u32,
    max_errors: u32,
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl PollBackoff {
    pub fn new() -> Self {
        Self {
            interval: INITIAL_POLL_INTERVAL,
            max_interval: MAX_POLL_INTERVAL,
            consecutive_errors: 0,
            max_errors: MAX_CONSECUTIVE_ERRORS,
        }
    }

    /// How long to sleep before the next poll.
    pub fn delay(&self) -> Duration {
        self.interval
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// A poll succeeded: reset the cadence.
    pub fn on_success(&mut self) {
        self.interval = INITIAL_POLL_INTERVAL;
        self.consecutive_errors = 0;
    }

    /// A poll hit a connection-level error. Returns `false` when the error
    /// budget is exhausted and the caller must abandon the job.
    pub fn on_error(&mut self) -> bool {
        self.consecutive_errors += 1;
        if self.consecutive_errors >= self.max_errors {
            return false;
        }
        self.interval = (self.interval * 2).min(self.max_interval);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_delay() {
        let backoff = PollBackoff::new();
        assert_eq!(backoff.delay(), INITIAL_POLL_INTERVAL);
    }

    #[test]
    fn test_interval_doubles_per_error() {
        let mut backoff = PollBackoff::new();
        assert!(backoff.on_error());
        assert_eq!(backoff.delay(), INITIAL_POLL_INTERVAL * 2);
        assert!(backoff.on_error());
        assert_eq!(backoff.delay(), INITIAL_POLL_INTERVAL * 4);
    }

    #[test]
    fn test_interval_never_exceeds_cap() {
        let mut backoff = PollBackoff::new();
        for _ in 0..9 {
            backoff.on_error();
            assert!(backoff.delay() <= MAX_POLL_INTERVAL);
        }
    }

    #[test]
    fn test_abandons_after_exactly_ten_errors() {
        let mut backoff = PollBackoff::new();
        for i in 1..MAX_CONSECUTIVE_ERRORS {
            assert!(backoff.on_error(), "error {} should not abandon", i);
        }
        assert!(!backoff.on_error(), "error 10 must abandon");
    }

    #[test]
    fn test_success_resets_everything() {
        let mut backoff = PollBackoff::new();
        for _ in 0..5 {
            backoff.on_error();
        }
        backoff.on_success();
        assert_eq!(backoff.delay(), INITIAL_POLL_INTERVAL);
        assert_eq!(backoff.consecutive_errors(), 0);
        // The full budget is available again after a success.
        for i in 1..MAX_CONSECUTIVE_ERRORS {
            assert!(backoff.on_error(), "error {} should not abandon", i);
        }
        assert!(!backoff.on_error());
    }
}
