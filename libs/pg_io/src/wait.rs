//! Fibonacci-backoff retry timer (spec §3, §4.1).
//!
//! Grounded on pgBackRest's `common/wait.c` (`waitNew`/`waitMore`), with
//! the spec's explicit redesign: after the total wait time has elapsed,
//! `more()` still returns `true` twice more, so a caller retrying in a
//! loop gets two extra attempts to use up whatever time its own
//! operation (e.g. a blocking read) actually took.

use std::time::{Duration, Instant};

pub struct Wait {
    total: Duration,
    sleep_current: Duration,
    sleep_prev: Duration,
    begin: Instant,
    /// Number of `more()` calls returned `true` purely on elapsed-budget
    /// grace, after the real sleep schedule ran out.
    grace_remaining: u32,
}

const GRACE_RETRIES: u32 = 2;

impl Wait {
    pub fn new(total: Duration) -> Self {
        let sleep_current = if total >= Duration::from_secs(1) {
            Duration::from_millis(100)
        } else {
            total / 10
        };
        Self {
            total,
            sleep_current,
            sleep_prev: Duration::ZERO,
            begin: Instant::now(),
            grace_remaining: GRACE_RETRIES,
        }
    }

    /// Sleep the current quantum and report whether the caller has more
    /// time left. Advances the Fibonacci schedule, clamped to whatever
    /// time remains in the total budget.
    pub fn more(&mut self) -> bool {
        if self.sleep_current.is_zero() {
            if self.grace_remaining > 0 {
                self.grace_remaining -= 1;
                return true;
            }
            return false;
        }

        std::thread::sleep(self.sleep_current);
        let elapsed = self.begin.elapsed();

        if elapsed < self.total {
            let next = self.sleep_current + self.sleep_prev;
            let remaining = self.total - elapsed;
            self.sleep_prev = self.sleep_current;
            self.sleep_current = next.min(remaining);
        } else {
            self.sleep_current = Duration::ZERO;
        }

        true
    }

    pub fn elapsed(&self) -> Duration {
        self.begin.elapsed()
    }

    /// Same schedule as [`more`](Self::more), sleeping on the async runtime
    /// instead of blocking the calling thread. Used by the HTTP client's
    /// retry loop.
    pub async fn more_async(&mut self) -> bool {
        if self.sleep_current.is_zero() {
            if self.grace_remaining > 0 {
                self.grace_remaining -= 1;
                return true;
            }
            return false;
        }

        tokio::time::sleep(self.sleep_current).await;
        let elapsed = self.begin.elapsed();

        if elapsed < self.total {
            let next = self.sleep_current + self.sleep_prev;
            let remaining = self.total - elapsed;
            self.sleep_prev = self.sleep_current;
            self.sleep_current = next.min(remaining);
        } else {
            self.sleep_current = Duration::ZERO;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_budget_divides_by_ten() {
        let w = Wait::new(Duration::from_millis(50));
        assert_eq!(w.sleep_current, Duration::from_millis(5));
    }

    #[test]
    fn long_budget_starts_at_one_tenth_second() {
        let w = Wait::new(Duration::from_secs(5));
        assert_eq!(w.sleep_current, Duration::from_millis(100));
    }

    #[test]
    fn more_returns_true_twice_after_budget_elapses() {
        // ∀ Wait w constructed with T >= 100ms: more() returns true at
        // least twice after total elapsed time exceeds T.
        let mut w = Wait::new(Duration::from_millis(5));
        let mut calls_after_elapsed = 0;
        loop {
            let more = w.more();
            if w.elapsed() >= Duration::from_millis(5) {
                if !more {
                    break;
                }
                calls_after_elapsed += 1;
                if calls_after_elapsed > 10 {
                    break;
                }
            }
            if !more {
                break;
            }
        }
        assert!(calls_after_elapsed >= 2);
    }
}
