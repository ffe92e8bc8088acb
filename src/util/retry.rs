use rand::{thread_rng, Rng};
use std::time::Duration;

/// Bounded exponential backoff shared by the tool retry loop and the refresh worker.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Option<Duration>,
    jitter_fraction: f64,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
            jitter_fraction: 0.0,
        }
    }

    /// Retries forever; used by loops that only stop on shutdown.
    pub fn unbounded(base_delay: Duration) -> Self {
        Self::exponential(usize::MAX, base_delay)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = if max_delay.is_zero() {
            None
        } else {
            Some(max_delay)
        };
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn handle(&self) -> RetryHandle {
        RetryHandle {
            policy: self.clone(),
            attempts: 0,
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn delay_for_retry(&self, retry: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let shift = retry.saturating_sub(1).min(31) as u32;
        let scaled = self.base_delay.saturating_mul(1u32 << shift);
        let bounded = match self.max_delay {
            Some(max) => scaled.min(max),
            None => scaled,
        };
        if self.jitter_fraction <= 0.0 || bounded.is_zero() {
            return bounded;
        }
        let factor = thread_rng()
            .gen_range((1.0 - self.jitter_fraction).max(0.0)..=1.0 + self.jitter_fraction);
        Duration::from_secs_f64((bounded.as_secs_f64() * factor).max(0.0))
    }
}

pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
}

impl RetryHandle {
    /// Records a failed attempt. Returns the delay before the next attempt, or
    /// `None` once `max_attempts` attempts have been spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        Some(self.policy.delay_for_retry(self.attempts))
    }

    pub fn failures(&self) -> usize {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
