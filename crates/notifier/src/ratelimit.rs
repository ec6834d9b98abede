//! Token-bucket admission control for a single delivery target.
//!
//! The bucket holds up to `rate × 1.5` tokens (never less than one) and
//! refills continuously at `rate` tokens per second. It starts full. All state
//! changes happen under one mutex, which is never held across an await.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use herald_common::error::AppError;

/// Burst allowance relative to the refill rate.
const BURST_FACTOR: f64 = 1.5;

/// Polls per refill period while waiting in [`TokenBucket::admit`].
const POLLS_PER_TOKEN: f64 = 5.0;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket limiter.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket refilling at `rate` tokens per second.
    pub fn new(rate: f64) -> Result<Self, AppError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(AppError::config(format!(
                "requests_per_second must be a positive number, got {rate}"
            )));
        }

        // below one token nothing could ever be admitted
        let capacity = (rate * BURST_FACTOR).max(1.0);
        tracing::info!(rate, capacity, "Initializing rate limiter");

        Ok(Self {
            rate,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens currently available, after refilling.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state);
        state.tokens
    }

    /// Consume one token if available.
    pub fn try_admit(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            tracing::trace!(tokens = state.tokens, rate = self.rate, "Rate limit: admitted");
            true
        } else {
            tracing::debug!(tokens = state.tokens, rate = self.rate, "Rate limit: denied");
            false
        }
    }

    /// Wait until a token is available, then consume it.
    ///
    /// Polls [`try_admit`](Self::try_admit) every `1 / (rate × 5)` seconds.
    /// Waiters are not queued, so there is no fairness between them.
    pub async fn admit(&self) {
        let start = Instant::now();
        let poll = self.poll_interval();
        let mut attempts = 0u32;

        while !self.try_admit() {
            attempts += 1;
            tokio::time::sleep(poll).await;

            if attempts % 5 == 0 {
                tracing::info!(
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    attempts,
                    rate = self.rate,
                    "Rate limit: waiting for token"
                );
            }
        }

        if attempts > 0 {
            tracing::debug!(
                elapsed_ms = start.elapsed().as_millis() as u64,
                attempts,
                "Rate limit: admitted after waiting"
            );
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / (self.rate * POLLS_PER_TOKEN))
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
    }
}
