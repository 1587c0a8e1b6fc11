//! Per-module-name limiters.
//!
//! The registry hands out one concurrency semaphore and one token bucket
//! per module name, shared across every run on the same runtime
//! instance. The first caller's limits stick for the lifetime of the
//! registry entry.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Token-bucket rate limiter: `capacity` tokens per `window`, refilled
/// continuously by elapsed time. Waiters sleep until a token is due.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    window: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, window: Duration) -> Self {
        TokenBucket {
            capacity,
            window,
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed();
        let rate = f64::from(self.capacity) / self.window.as_secs_f64();
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * rate).min(f64::from(self.capacity));
        state.last_refill = Instant::now();
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next token would be available.
    fn next_token_in(&self) -> Duration {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let missing = 1.0 - state.tokens;
        let rate = f64::from(self.capacity) / self.window.as_secs_f64();
        Duration::from_secs_f64(missing / rate)
    }

    /// Wait until a token can be taken.
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            let wait = self.next_token_in().max(Duration::from_millis(1));
            tokio::time::sleep(wait).await;
        }
    }
}

/// Shared registry of per-module-name limiters.
#[derive(Debug, Default)]
pub struct LimiterRegistry {
    semaphores: DashMap<String, Arc<Semaphore>>,
    buckets: DashMap<String, Arc<TokenBucket>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The concurrency semaphore for a module name.
    pub fn semaphore(&self, module_name: &str, limit: u32) -> Arc<Semaphore> {
        self.semaphores
            .entry(module_name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(limit as usize)))
            .clone()
    }

    /// The token bucket for a module name.
    pub fn bucket(&self, module_name: &str, count: u32, window: Duration) -> Arc<TokenBucket> {
        self.buckets
            .entry(module_name.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(count, window)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_enforces_capacity() {
        let bucket = TokenBucket::new(3, Duration::from_secs(60));
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test]
    async fn test_bucket_refills_over_time() {
        let bucket = TokenBucket::new(10, Duration::from_millis(100));
        for _ in 0..10 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
        // One token refills every 10ms at this rate
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(bucket.try_acquire());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_a_token() {
        let bucket = TokenBucket::new(1, Duration::from_millis(50));
        bucket.acquire().await;
        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_limiters_are_shared_per_module_name() {
        let registry = LimiterRegistry::new();
        let a = registry.semaphore("fetch", 2);
        let b = registry.semaphore("fetch", 99);
        // First registration wins; both handles are the same semaphore
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.available_permits(), 2);
    }
}
