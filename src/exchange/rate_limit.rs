// =============================================================================
// Token-bucket rate limiter — back-pressure for the shared REST client
// =============================================================================
//
// The exchange enforces per-second request and order caps. Rather than
// failing callers that exceed them, the bucket delays the caller until a
// token is available, so bursts from many concurrent worker loops smooth out
// into a compliant request rate.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

/// Requests-per-second bucket with burst capacity.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// `capacity` is the burst size; `refill_per_sec` is the sustained rate.
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec: refill_per_sec as f64,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available. Never fails.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut s = self.state.lock();
                let elapsed = s.last_refill.elapsed().as_secs_f64();
                s.tokens = (s.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                s.last_refill = Instant::now();

                if s.tokens >= 1.0 {
                    s.tokens -= 1.0;
                    None
                } else {
                    // Time until the next whole token accrues.
                    Some(Duration::from_secs_f64(
                        (1.0 - s.tokens) / self.refill_per_sec,
                    ))
                }
            };

            match wait {
                None => return,
                Some(d) => {
                    trace!(delay_ms = d.as_millis() as u64, "rate limiter delaying caller");
                    tokio::time::sleep(d).await;
                }
            }
        }
    }

    /// Tokens currently available (for diagnostics).
    pub fn available(&self) -> f64 {
        let mut s = self.state.lock();
        let elapsed = s.last_refill.elapsed().as_secs_f64();
        s.tokens = (s.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        s.last_refill = Instant::now();
        s.tokens
    }
}

// =============================================================================
// Tests
// =============================================================================
