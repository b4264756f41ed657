//! Per-provider rate limiting for capability calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// One provider's budget.
struct Bucket {
    permits: Arc<Semaphore>,
    /// Earliest instant the next request may start.
    next_slot: Mutex<Instant>,
}

/// Limits in-flight calls and request spacing per provider.
///
/// Buckets are created lazily on first use, so a provider name never
/// needs to be declared up front.
pub struct RateLimiter {
    max_concurrent: usize,
    min_interval: Option<Duration>,
    buckets: std::sync::Mutex<HashMap<String, Arc<Bucket>>>,
}

impl RateLimiter {
    /// `requests_per_minute == 0` disables spacing.
    pub fn new(max_concurrent: usize, requests_per_minute: u32) -> Self {
        let min_interval = (requests_per_minute > 0)
            .then(|| Duration::from_secs(60) / requests_per_minute);
        Self {
            max_concurrent: max_concurrent.max(1),
            min_interval,
            buckets: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn bucket(&self, provider: &str) -> Arc<Bucket> {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(buckets.entry(provider.to_string()).or_insert_with(|| {
            Arc::new(Bucket {
                permits: Arc::new(Semaphore::new(self.max_concurrent)),
                next_slot: Mutex::new(Instant::now()),
            })
        }))
    }

    /// Wait for a slot with `provider`. The call holds the returned permit
    /// until it finishes.
    pub async fn acquire(&self, provider: &str) -> Option<OwnedSemaphorePermit> {
        let bucket = self.bucket(provider);
        let permit = Arc::clone(&bucket.permits).acquire_owned().await.ok()?;

        if let Some(interval) = self.min_interval {
            let wait_until = {
                let mut next = bucket.next_slot.lock().await;
                let now = Instant::now();
                let slot = (*next).max(now);
                *next = slot + interval;
                slot
            };
            tokio::time::sleep_until(wait_until).await;
        }
        Some(permit)
    }

    /// Permits currently free for `provider`.
    pub fn available(&self, provider: &str) -> usize {
        self.bucket(provider).permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn caps_in_flight_calls_per_provider() {
        let limiter = RateLimiter::new(2, 0);
        let a = limiter.acquire("search").await.unwrap();
        let _b = limiter.acquire("search").await.unwrap();
        assert_eq!(limiter.available("search"), 0);

        // Other providers are independent.
        assert_eq!(limiter.available("llm"), 2);

        drop(a);
        assert_eq!(limiter.available("search"), 1);
    }

    #[tokio::test]
    async fn blocked_caller_resumes_when_permit_is_released() {
        let limiter = Arc::new(RateLimiter::new(1, 0));
        let held = limiter.acquire("p").await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire("p").await.is_some() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn spaces_requests_by_rpm() {
        let limiter = RateLimiter::new(4, 60);
        let start = Instant::now();
        for _ in 0..3 {
            let _permit = limiter.acquire("p").await.unwrap();
        }
        // Slots at 0s, 1s, 2s.
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
