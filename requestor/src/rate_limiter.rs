//! Process-wide token bucket pacing every outbound API call.
use crate::config::RateLimitConfig;
use crate::metrics_defs::LIMITER_WAIT;
use shared::histogram;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep};

/// Slowest refill accepted, so a permit is never more than ~17 minutes away.
const MIN_REFILL_PER_SEC: f64 = 0.001;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let defaults = RateLimitConfig::default();
        // A bucket smaller than one token could never admit a call.
        let capacity = if config.capacity.is_finite() {
            config.capacity.max(1.0)
        } else {
            defaults.capacity
        };
        let refill_per_sec = if config.refill_per_sec.is_finite() && config.refill_per_sec > 0.0 {
            config.refill_per_sec.max(MIN_REFILL_PER_SEC)
        } else {
            defaults.refill_per_sec
        };

        RateLimiter {
            capacity,
            refill_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until one permit is available and consumes it. Never fails.
    ///
    /// The guard is held across the wait so concurrent callers queue up behind
    /// the one currently sleeping instead of all computing the same wait.
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return;
        }

        let wait = Duration::try_from_secs_f64((1.0 - bucket.tokens) / self.refill_per_sec)
            .unwrap_or(Duration::from_secs_f64(1.0 / MIN_REFILL_PER_SEC));
        tracing::debug!(wait_ms = wait.as_millis() as u64, "Waiting for rate limit permit");
        histogram!(LIMITER_WAIT).record(wait.as_secs_f64());
        sleep(wait).await;

        bucket.tokens = 0.0;
        bucket.last_refill = Instant::now();
    }

    /// Current token count after refill, without consuming anything.
    #[cfg(test)]
    pub async fn available(&self) -> f64 {
        let bucket = self.bucket.lock().await;
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity)
    }
}
