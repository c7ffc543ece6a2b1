//! Per-client token bucket (spec.md §3, §4.6).
//!
//! One bucket exists per `(rule, client IP)` pair, created lazily and
//! held in [`crate::rule_runtime::RuleRuntime`]. Refill happens lazily on
//! read rather than via a background timer: every `try_acquire` first
//! tops the bucket up for elapsed time, then attempts to take one token.

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl TokenBucket {
    /// `rate_per_sec <= 0` is rejected by the caller before construction;
    /// this type always represents an active, rate-limited bucket.
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let capacity = burst.max(1) as f64;
        TokenBucket {
            capacity,
            refill_per_sec: rate_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
                last_used: Instant::now(),
            }),
        }
    }

    /// Tops up for elapsed time, then takes one token if available.
    /// Returns `true` on success, `false` if the bucket is empty.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        let elapsed = now.saturating_duration_since(state.last_refill);
        self.refill(&mut state, elapsed, now);
        state.last_used = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&self, state: &mut BucketState, elapsed: Duration, now: Instant) {
        let added = elapsed.as_secs_f64() * self.refill_per_sec;
        if added > 0.0 {
            state.tokens = (state.tokens + added).min(self.capacity);
            state.last_refill = now;
        }
    }

    /// Time since this bucket was last touched by `try_acquire`, tracked
    /// independently of the refill timestamp (which only advances when a
    /// nonzero number of tokens is actually added back) so a bucket in
    /// active but very-low-rate use is never mistaken for idle. Used by
    /// [`crate::rule_runtime::RuleRuntime`]'s idle eviction sweep.
    pub fn idle_for(&self) -> Duration {
        self.state.lock().unwrap().last_used.elapsed()
    }
}
