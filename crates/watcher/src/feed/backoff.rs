use std::time::Duration;

/// Capped exponential reconnect delay.
#[derive(Debug)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            initial,
            max,
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| self.attempt >= max) {
            return None;
        }
        let factor = 2_u32.saturating_pow(self.attempt.min(31));
        let delay = self.initial.saturating_mul(factor).min(self.max);
        self.attempt += 1;
        Some(delay)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
