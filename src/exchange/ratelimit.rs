//! Per-API-key, per-endpoint-family rate-limit buckets (spec §4.1, §5).
//!
//! A plain token bucket rather than the teacher's HFT-grade lock-free
//! counters (`scrapers/binance_book_ticker_metrics.rs`) — this gateway
//! issues REST calls at human/strategy cadence, not tick-rate.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointFamily {
    Klines,
    Account,
    Orders,
    AlgoOrders,
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Keyed by `(api_key, endpoint_family)`. A missing key gets a fresh bucket
/// with generous defaults on first use.
pub struct RateLimiter {
    buckets: Mutex<HashMap<(String, EndpointFamily), Bucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn defaults_for(family: EndpointFamily) -> (f64, f64) {
        match family {
            EndpointFamily::Klines => (1200.0, 20.0),
            EndpointFamily::Account => (600.0, 10.0),
            EndpointFamily::Orders => (300.0, 5.0),
            EndpointFamily::AlgoOrders => (300.0, 5.0),
        }
    }

    /// Returns `true` if a request may proceed now; `false` means the caller
    /// should back off (spec §4.1 "rate-limit buckets keyed by API key and
    /// by endpoint family").
    pub fn try_acquire(&self, api_key: &str, family: EndpointFamily) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry((api_key.to_string(), family))
            .or_insert_with(|| {
                let (cap, refill) = Self::defaults_for(family);
                Bucket::new(cap, refill)
            });
        bucket.try_take()
    }

    /// Blocks (async-friendly poll loop) until a token is available.
    pub async fn acquire(&self, api_key: &str, family: EndpointFamily) {
        while !self.try_acquire(api_key, family) {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_exhausts_then_refills() {
        let limiter = RateLimiter::new();
        let mut acquired = 0;
        for _ in 0..2000 {
            if limiter.try_acquire("k1", EndpointFamily::Orders) {
                acquired += 1;
            }
        }
        assert!(acquired >= 300 && acquired < 2000);
    }

    #[test]
    fn buckets_are_independent_per_key() {
        let limiter = RateLimiter::new();
        for _ in 0..300 {
            limiter.try_acquire("k1", EndpointFamily::Orders);
        }
        assert!(limiter.try_acquire("k2", EndpointFamily::Orders));
    }
}
