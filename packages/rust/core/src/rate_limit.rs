//! Token-bucket rate limiting per lookup kind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use enrichkit_shared::{LookupKind, RateLimit};
use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket refilled continuously at `per_second`, holding at most
/// `burst` tokens. A non-positive rate disables limiting.
pub struct RateLimiter {
    per_second: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        let burst = f64::from(limit.burst.max(1));
        Self {
            per_second: limit.per_second,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        if self.per_second <= 0.0 {
            return;
        }
        while let Some(wait) = self.try_take() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token now, or return how long until one is available.
    fn try_take(&self) -> Option<Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.per_second).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            None
        } else {
            let missing = 1.0 - bucket.tokens;
            Some(Duration::from_secs_f64(missing / self.per_second))
        }
    }
}

/// One limiter per configured lookup kind. Kinds without an entry are not
/// limited.
#[derive(Default, Clone)]
pub struct RateLimiters {
    by_kind: HashMap<LookupKind, Arc<RateLimiter>>,
}

impl RateLimiters {
    pub fn new(limits: &HashMap<LookupKind, RateLimit>) -> Self {
        Self {
            by_kind: limits
                .iter()
                .map(|(kind, limit)| (*kind, Arc::new(RateLimiter::new(*limit))))
                .collect(),
        }
    }

    /// Wait for the limiter of `kind`, if it has one.
    pub async fn acquire(&self, kind: LookupKind) {
        if let Some(limiter) = self.by_kind.get(&kind) {
            limiter.acquire().await;
        }
    }
}
