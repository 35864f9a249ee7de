use std::{collections::HashMap, sync::Arc, time::Duration};

use parley_core::UserId;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::Instant,
};

const PURGE_INTERVAL: Duration = Duration::from_secs(300);
const MAX_IDLE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, rate: f64, capacity: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        self.tokens = (self.tokens + elapsed * rate).min(capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-user token buckets throttling message sends.
#[derive(Clone)]
pub struct SendRateLimiter {
    buckets: Arc<Mutex<HashMap<UserId, TokenBucket>>>,
    /// Tokens regained per second.
    rate: f64,
    capacity: f64,
}

impl SendRateLimiter {
    /// Allow `per_minute` sends per user per minute, with bursts of the same size.
    pub fn per_minute(per_minute: u32) -> Self {
        let capacity = f64::from(per_minute);
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            rate: capacity / 60.0,
            capacity,
        }
    }

    pub async fn check(&self, user_id: UserId) -> bool {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(user_id)
            .or_insert_with(|| TokenBucket::new(self.capacity));
        bucket.try_consume(self.rate, self.capacity)
    }

    pub async fn purge_stale(&self, max_idle: Duration) -> usize {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        let now = Instant::now();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_refill) < max_idle);
        before - buckets.len()
    }

    /// Evict idle buckets periodically until shutdown.
    pub fn spawn_purge(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PURGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let purged = limiter.purge_stale(MAX_IDLE).await;
                        if purged > 0 {
                            tracing::debug!(purged, "evicted idle send rate buckets");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}
