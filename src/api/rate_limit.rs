//! Token bucket throttling for mutating requests.
//!
//! Two bucket families are kept: one per bar and one per client address. A
//! request has to find a token in both. Buckets are created on first use and
//! swept once idle. State is process-local; several replicas each enforce
//! their own budget.

use std::{collections::HashSet, net::IpAddr, sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info};

use crate::domain::error::{QueueError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub bar: BucketConfig,
    pub client: BucketConfig,
    /// Bars that skip their bar bucket.
    pub allowlist: HashSet<String>,
    /// Buckets untouched for this long are evicted.
    pub idle: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            bar: BucketConfig {
                capacity: 20.0,
                refill_per_sec: 1.0,
            },
            client: BucketConfig {
                capacity: 50.0,
                refill_per_sec: 5.0,
            },
            allowlist: HashSet::new(),
            idle: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(config: &BucketConfig, now: Instant) -> Self {
        Self {
            tokens: config.capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, config: &BucketConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_per_sec).min(config.capacity);
        self.last_refill = now;
    }

    /// Seconds until a token is available, or `None` if one is available now.
    fn retry_after(&self, config: &BucketConfig) -> Option<u64> {
        if self.tokens >= 1.0 {
            return None;
        }
        if config.refill_per_sec <= 0.0 {
            return Some(u64::MAX);
        }
        Some(((1.0 - self.tokens) / config.refill_per_sec).ceil().max(1.0) as u64)
    }
}

#[derive(Debug)]
pub struct TokenBucketLimiter {
    config: RateLimitConfig,
    bars: DashMap<String, TokenBucket>,
    clients: DashMap<IpAddr, TokenBucket>,
}

impl TokenBucketLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            bars: DashMap::new(),
            clients: DashMap::new(),
        }
    }

    /// Takes one token from the bar's bucket and one from the client's.
    /// Nothing is taken unless both have one to give.
    pub fn check(&self, bar_id: Option<&str>, client: Option<IpAddr>) -> Result<()> {
        let now = Instant::now();

        let mut bar = bar_id
            .filter(|id| !self.config.allowlist.contains(*id))
            .map(|id| {
                self.bars.entry(id.to_string()).or_insert_with(|| {
                    debug!(bar_id = id, "Creating bar bucket");
                    TokenBucket::full(&self.config.bar, now)
                })
            });
        let mut client = client.map(|addr| {
            self.clients.entry(addr).or_insert_with(|| {
                debug!(client = %addr, "Creating client bucket");
                TokenBucket::full(&self.config.client, now)
            })
        });

        if let Some(bucket) = bar.as_mut() {
            bucket.refill(&self.config.bar, now);
        }
        if let Some(bucket) = client.as_mut() {
            bucket.refill(&self.config.client, now);
        }

        let retry_after = [
            bar.as_ref().and_then(|b| b.retry_after(&self.config.bar)),
            client.as_ref().and_then(|c| c.retry_after(&self.config.client)),
        ]
        .into_iter()
        .flatten()
        .max();

        if let Some(retry_after_secs) = retry_after {
            info!(bar_id, retry_after_secs, "Rate limited");
            return Err(QueueError::RateLimited { retry_after_secs });
        }

        if let Some(bucket) = bar.as_mut() {
            bucket.tokens -= 1.0;
        }
        if let Some(bucket) = client.as_mut() {
            bucket.tokens -= 1.0;
        }

        Ok(())
    }

    /// Evicts buckets idle for longer than the configured window.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle = self.config.idle;
        let before = self.bucket_count();

        self.bars
            .retain(|_, b| now.saturating_duration_since(b.last_refill) < idle);
        self.clients
            .retain(|_, b| now.saturating_duration_since(b.last_refill) < idle);

        let evicted = before - self.bucket_count();
        if evicted > 0 {
            debug!(evicted, "Swept idle rate limit buckets");
        }
        evicted
    }

    pub fn bucket_count(&self) -> usize {
        self.bars.len() + self.clients.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                limiter.sweep();
            }
        })
    }
}
