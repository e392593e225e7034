//! Per-key token-bucket rate limiting for `chat.send`.
//!
//! Keyed by `user_id` when the connection authenticated with one, else by
//! the connection id — multiple connections sharing a `user_id` share a
//! bucket. A rate of zero disables limiting entirely.

use std::time::Instant;

use dashmap::DashMap;

use moltis_config::schema::RateLimitConfig;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

/// Token-bucket limiter, one bucket per key.
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    requests_per_minute: u32,
    burst: u32,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            requests_per_minute: config.requests_per_minute,
            burst: config.burst,
        }
    }

    /// `true` if the request is allowed (and consumes a token), `false` if
    /// the key is over its limit. Always `true` when the configured rate is
    /// zero.
    pub fn check(&self, key: &str) -> bool {
        if self.requests_per_minute == 0 {
            return true;
        }
        let refill_per_sec = self.requests_per_minute as f64 / 60.0;
        let capacity = self.burst.max(1) as f64;
        let now = Instant::now();

        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket {
                tokens: capacity,
                last_refill: now,
                last_used: now,
            });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(capacity);
        bucket.last_refill = now;
        bucket.last_used = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets idle for longer than 10 minutes. Intended to run every 5
    /// minutes from a background task.
    pub fn gc(&self) {
        let cutoff = std::time::Duration::from_secs(600);
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_used) < cutoff);
    }
}
