//! Token bucket rate limiter
//!
//! The bucket holds `burst` tokens and is topped up to full once per
//! `refill_interval`. Coinbase allows a handful of private requests per
//! second per profile, so the defaults stay well under that.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Tokens available per refill interval
    pub burst: usize,
    pub refill_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            burst: 5,
            refill_interval: Duration::from_secs(1),
        }
    }
}

impl RateLimiterConfig {
    pub fn with_rate(mut self, requests_per_interval: usize) -> Self {
        self.burst = requests_per_interval.max(1);
        self
    }

    pub fn with_refill_interval(mut self, interval: Duration) -> Self {
        self.refill_interval = interval;
        self
    }
}

/// Cloning shares the bucket
#[derive(Debug, Clone)]
pub struct RateLimiter {
    tokens: Arc<Semaphore>,
    burst: usize,
    refill_interval: Duration,
    last_refill: Arc<Mutex<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            tokens: Arc::new(Semaphore::new(config.burst)),
            burst: config.burst,
            refill_interval: config.refill_interval,
            last_refill: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Wait until a token is available and consume it
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire().await {
                return;
            }
            let wait = {
                let last = self.last_refill.lock().await;
                self.refill_interval.saturating_sub(last.elapsed())
            };
            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Consume a token if one is available right now
    pub async fn try_acquire(&self) -> bool {
        self.refill().await;
        match self.tokens.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    pub fn available(&self) -> usize {
        self.tokens.available_permits()
    }

    pub fn burst(&self) -> usize {
        self.burst
    }

    async fn refill(&self) {
        let mut last = self.last_refill.lock().await;
        if last.elapsed() < self.refill_interval {
            return;
        }
        let missing = self.burst.saturating_sub(self.tokens.available_permits());
        if missing > 0 {
            self.tokens.add_permits(missing);
        }
        *last = Instant::now();
    }
}
