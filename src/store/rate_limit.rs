// =============================================================================
// Write Limiter — token-bucket throttle in front of the document store
// =============================================================================
//
// The persistence layer tolerates a bounded write rate (design target: 500
// writes per second process-wide). Every mutating store call acquires one
// token; callers block cooperatively when the bucket is dry. Once the bucket
// crosses 70 % utilization, a small random delay is added to each acquisition
// so a saturated tick spreads its writes instead of thundering.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use super::Store;
use crate::errors::CoreResult;

/// Utilization fraction past which jitter kicks in.
const JITTER_UTILIZATION: f64 = 0.70;
/// Upper bound of the added jitter, milliseconds.
const JITTER_MAX_MS: u64 = 25;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Process-wide token-bucket limiter for persistence writes.
pub struct WriteLimiter {
    bucket: Mutex<Bucket>,
    /// Tokens added per second.
    rate: f64,
    /// Bucket capacity (burst allowance).
    burst: f64,
}

/// Snapshot of the limiter's counters.
#[derive(Debug, Clone, Serialize)]
pub struct WriteLimiterSnapshot {
    pub available_tokens: f64,
    pub burst: f64,
    pub rate_per_sec: f64,
    pub utilization: f64,
}

impl WriteLimiter {
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        let rate = f64::from(rate_per_sec.max(1));
        let burst = f64::from(burst.max(1));
        Self {
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            rate,
            burst,
        }
    }

    fn refill(&self, b: &mut Bucket) {
        let elapsed = b.last_refill.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            b.tokens = (b.tokens + elapsed * self.rate).min(self.burst);
            b.last_refill = Instant::now();
        }
    }

    /// Take a token without waiting. Returns `false` when the bucket is dry.
    pub fn try_acquire(&self) -> bool {
        let mut b = self.bucket.lock();
        self.refill(&mut b);
        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take a token, blocking cooperatively until one is available.
    pub async fn acquire(&self) {
        loop {
            let (acquired, utilization, wait) = {
                let mut b = self.bucket.lock();
                self.refill(&mut b);
                let utilization = 1.0 - (b.tokens / self.burst);
                if b.tokens >= 1.0 {
                    b.tokens -= 1.0;
                    (true, utilization, Duration::ZERO)
                } else {
                    // Time until one full token has accrued.
                    let deficit = 1.0 - b.tokens;
                    (
                        false,
                        utilization,
                        Duration::from_secs_f64(deficit / self.rate),
                    )
                }
            };

            if acquired {
                if utilization > JITTER_UTILIZATION {
                    let jitter_ms = rand::thread_rng().gen_range(1..=JITTER_MAX_MS);
                    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                }
                return;
            }

            warn!(
                wait_ms = wait.as_millis() as u64,
                "write limiter saturated, backing off"
            );
            let jitter_ms = rand::thread_rng().gen_range(1..=JITTER_MAX_MS);
            tokio::time::sleep(wait + Duration::from_millis(jitter_ms)).await;
        }
    }

    /// Current bucket state.
    pub fn snapshot(&self) -> WriteLimiterSnapshot {
        let mut b = self.bucket.lock();
        self.refill(&mut b);
        WriteLimiterSnapshot {
            available_tokens: b.tokens,
            burst: self.burst,
            rate_per_sec: self.rate,
            utilization: 1.0 - (b.tokens / self.burst),
        }
    }
}

impl std::fmt::Debug for WriteLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("WriteLimiter")
            .field("rate_per_sec", &snap.rate_per_sec)
            .field("burst", &snap.burst)
            .field("available_tokens", &snap.available_tokens)
            .finish()
    }
}

// =============================================================================
// Rate-limited store decorator
// =============================================================================

/// Wraps any [`Store`], charging the shared [`WriteLimiter`] for every
/// mutation. Reads pass through untouched.
pub struct RateLimitedStore {
    inner: Arc<dyn Store>,
    limiter: Arc<WriteLimiter>,
}

impl RateLimitedStore {
    pub fn new(inner: Arc<dyn Store>, limiter: Arc<WriteLimiter>) -> Self {
        Self { inner, limiter }
    }

    pub fn limiter(&self) -> &WriteLimiter {
        &self.limiter
    }
}

#[async_trait]
impl Store for RateLimitedStore {
    async fn get(&self, path: &str) -> CoreResult<Option<Value>> {
        self.inner.get(path).await
    }

    async fn set(&self, path: &str, doc: Value) -> CoreResult<()> {
        self.limiter.acquire().await;
        self.inner.set(path, doc).await
    }

    async fn delete(&self, path: &str) -> CoreResult<()> {
        self.limiter.acquire().await;
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<(String, Value)>> {
        self.inner.list(prefix).await
    }
}
