// Token-bucket rate limiter for the per-subscriber publish path.
use std::sync::Mutex;
use std::time::Instant;

// Tokens are scaled so refill keeps sub-token precision without floats.
const TOKEN_SCALE: u64 = 1000;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
#[error("rate limited, retry after {retry_after_seconds}s")]
pub struct RateLimited {
    pub retry_after_seconds: f64,
}

/// Token bucket admitting `rate` requests per second with a burst
/// allowance of `burst` on top. The bucket starts full, so over any
/// one-second window at most `rate + burst` acquisitions succeed.
/// Acquisition is all-or-nothing; refill is continuous by elapsed time.
///
/// ```
/// use murmur_core::limiter::TokenBucket;
///
/// let bucket = TokenBucket::new(10, 5);
/// for _ in 0..15 {
///     bucket.try_acquire().expect("within burst");
/// }
/// let denied = bucket.try_acquire().expect_err("bucket drained");
/// assert!(denied.retry_after_seconds > 0.0);
/// ```
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    rate: u64,
    capacity: u64,
}

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: u64, burst: u64) -> Self {
        let rate = rate.max(1);
        let capacity = (rate + burst) * TOKEN_SCALE;
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            rate,
            capacity,
        }
    }

    /// Take one token, refilling by elapsed time first. Refill and
    /// acquisition happen under one lock so concurrent callers cannot
    /// double-spend the same refill.
    pub fn try_acquire(&self) -> Result<(), RateLimited> {
        let mut state = self.state.lock().expect("bucket lock");

        let now = Instant::now();
        let elapsed_ms = now.duration_since(state.last_refill).as_millis() as u64;
        if elapsed_ms > 0 {
            // rate tokens/sec == rate scaled-tokens/ms at SCALE 1000.
            state.tokens = (state.tokens + elapsed_ms * self.rate).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens < TOKEN_SCALE {
            let missing = TOKEN_SCALE - state.tokens;
            return Err(RateLimited {
                retry_after_seconds: missing as f64 / (self.rate * TOKEN_SCALE) as f64,
            });
        }
        state.tokens -= TOKEN_SCALE;
        Ok(())
    }
}
