use std::sync::Mutex;
use std::time::Instant;

use quasar_common::TokenBucketSpec;

/// Token bucket shared by every request for one model or one user.
///
/// Starts full. `request` refills from elapsed time and takes one token
/// under a short lock, so concurrent callers never overdraw it.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    capacity: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
    }
}

impl TokenBucket {
    pub fn new(spec: TokenBucketSpec) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: spec.capacity,
                capacity: spec.capacity,
                refill_per_second: spec.refill_per_second,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn request(&self) -> bool {
        self.request_at(Instant::now())
    }

    fn request_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.refill(now);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Resize in place. Tokens already earned are kept up to the new capacity.
    pub fn reconfigure(&self, spec: TokenBucketSpec) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.refill(Instant::now());
        state.capacity = spec.capacity;
        state.refill_per_second = spec.refill_per_second;
        state.tokens = state.tokens.min(spec.capacity);
    }

    pub fn spec(&self) -> TokenBucketSpec {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        TokenBucketSpec {
            capacity: state.capacity,
            refill_per_second: state.refill_per_second,
        }
    }

    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.refill(Instant::now());
        state.tokens
    }
}
