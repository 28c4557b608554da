//! The per-request time budget.
//!
//! A deadline on the monotonic clock is checked at every `find_node` entry;
//! an exceeded budget aborts the request with a timeout error and the caller
//! flushes all caches, on the theory that memoization has degenerated. The
//! timer is paused around the compiler-defaults probe, whose child wait must
//! not be charged to the request.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct RequestTimer {
    quota: Duration,
    deadline: Instant,
    paused_at: Option<Instant>,
}

impl RequestTimer {
    pub fn new(quota: Duration) -> Self {
        Self {
            quota,
            deadline: Instant::now() + quota,
            paused_at: None,
        }
    }

    /// Fail with a timeout error when the deadline has passed.
    pub fn check(&self) -> Result<()> {
        if self.paused_at.is_none() && Instant::now() > self.deadline {
            return Err(Error::Timeout { quota: self.quota });
        }
        Ok(())
    }

    /// Stop charging time to the request; nestable calls are not needed and
    /// not supported.
    pub fn pause(&mut self) {
        debug_assert!(self.paused_at.is_none());
        self.paused_at = Some(Instant::now());
    }

    /// Resume after [`pause`](Self::pause), extending the deadline by the
    /// paused duration.
    pub fn resume(&mut self) {
        if let Some(paused_at) = self.paused_at.take() {
            self.deadline += paused_at.elapsed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_timer_passes() {
        let timer = RequestTimer::new(Duration::from_secs(60));
        assert!(timer.check().is_ok());
    }

    #[test]
    fn expired_timer_fails() {
        let timer = RequestTimer::new(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(timer.check(), Err(Error::Timeout { .. })));
    }

    #[test]
    fn pause_suppresses_and_extends() {
        let mut timer = RequestTimer::new(Duration::ZERO);
        timer.pause();
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.check().is_ok(), "paused timers never fire");
        timer.resume();
        // The deadline moved by the paused span, but the original quota of
        // zero is still long gone.
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.check().is_err());
    }
}
