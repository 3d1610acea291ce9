//! Exponential backoff with jitter

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    jitter: f64,
    cap: Duration,
    max_tries: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, jitter: f64, cap: Duration, max_tries: u32) -> Self {
        Self {
            base,
            factor,
            jitter,
            cap,
            max_tries,
            attempt: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the next retry, or `None` once the tries are used up
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_tries {
            return None;
        }

        let exp = self.factor.powi(self.attempt as i32);
        let delay = self.base.mul_f64(exp).min(self.cap);
        self.attempt += 1;

        if self.jitter > 0.0 {
            let spread = rand::rng().random_range(0.0..=self.jitter);
            Some(delay.mul_f64(1.0 + spread))
        } else {
            Some(delay)
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    /// 1s doubling to 60s, 10% jitter, 10 tries
    fn default() -> Self {
        Self::new(
            Duration::from_secs(1),
            2.0,
            0.1,
            Duration::from_secs(60),
            10,
        )
    }
}
