//! Restart decision logic, kept free of clocks and processes so it can
//! be tested directly.

use std::time::{Duration, Instant};

/// Capped exponential backoff between `phc2sys` restarts: attempt `k`
/// must wait at least `base_delay * 2^k` after the previous attempt,
/// with `k` capped; a stretch of stability resets the counter.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    base_delay: Duration,
    stabilisation_window: Duration,
    attempt_cap: u32,
    attempts: u32,
    last_restart: Option<Instant>,
    stable_since: Option<Instant>,
}

impl RestartPolicy {
    pub fn new(base_delay: Duration, stabilisation_window: Duration, attempt_cap: u32) -> Self {
        Self {
            base_delay,
            stabilisation_window,
            attempt_cap,
            attempts: 0,
            last_restart: None,
            stable_since: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Feed one observation; returns true when a restart should be
    /// issued now.
    pub fn observe(&mut self, diverged: bool, now: Instant) -> bool {
        if !diverged {
            let since = *self.stable_since.get_or_insert(now);
            if now.duration_since(since) >= self.stabilisation_window && self.attempts > 0 {
                self.attempts = 0;
                self.last_restart = None;
            }
            return false;
        }

        self.stable_since = None;
        match self.last_restart {
            None => {
                self.record_restart(now);
                true
            }
            Some(last) => {
                let k = self.attempts.min(self.attempt_cap);
                let wait = self.base_delay.saturating_mul(1 << k);
                if now.duration_since(last) >= wait {
                    self.record_restart(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_restart(&mut self, now: Instant) {
        self.last_restart = Some(now);
        self.attempts = (self.attempts + 1).min(self.attempt_cap);
    }
}
