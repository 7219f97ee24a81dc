//! Kline Stream Manager (spec §4.3): a batched `(symbol, interval)`
//! subscription set, health-checked on a timer, force-rotated before a
//! 30-minute connection cap, publishing only finalized bars.
//!
//! Grounded on `scrapers/binance_session.rs`'s heartbeat/proactive-resync
//! pattern (tear down and resubscribe before a hard timeout, rather than
//! waiting for an error), applied per-subscription instead of per-session.

use crate::exchange::ExchangeGateway;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const FORCED_ROTATION_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// A finalized kline bar (spec §4.3 "only the latest within a bar is
/// relevant" — partial updates never reach this sink).
#[derive(Debug, Clone)]
pub struct FinalizedKline {
    pub symbol: String,
    pub interval: String,
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

struct Subscription {
    last_seen: Arc<SyncMutex<Instant>>,
    spawned_at: Instant,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct KlineStreamManager {
    exchange: Arc<ExchangeGateway>,
    sink: broadcast::Sender<FinalizedKline>,
    subs: Mutex<HashMap<(String, String), Subscription>>,
}

impl KlineStreamManager {
    pub fn new(exchange: Arc<ExchangeGateway>) -> Self {
        let (sink, _) = broadcast::channel(512);
        Self {
            exchange,
            sink,
            subs: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe_finalized(&self) -> broadcast::Receiver<FinalizedKline> {
        self.sink.subscribe()
    }

    /// Adds subscriptions in a batch; already-subscribed pairs are no-ops
    /// (spec §4.3 "add/remove in batches").
    pub async fn add_subscriptions(&self, pairs: &[(String, String)]) {
        for (symbol, interval) in pairs {
            self.ensure_subscribed(symbol, interval).await;
        }
    }

    /// Currently subscribed `(symbol, interval)` pairs, for reconciling
    /// against the tracked-futures set (spec §4.3 "add/remove in batches").
    pub async fn current_subscriptions(&self) -> Vec<(String, String)> {
        self.subs.lock().await.keys().cloned().collect()
    }

    pub async fn remove_subscriptions(&self, pairs: &[(String, String)]) {
        let mut subs = self.subs.lock().await;
        for (symbol, interval) in pairs {
            if let Some(sub) = subs.remove(&(symbol.clone(), interval.clone())) {
                let _ = sub.shutdown.send(true);
                sub.task.abort();
            }
        }
    }

    async fn ensure_subscribed(&self, symbol: &str, interval: &str) {
        let key = (symbol.to_string(), interval.to_string());
        let mut subs = self.subs.lock().await;
        if subs.contains_key(&key) {
            return;
        }
        let sub = self.spawn_subscription(symbol.to_string(), interval.to_string());
        subs.insert(key, sub);
    }

    fn spawn_subscription(&self, symbol: String, interval: String) -> Subscription {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let last_seen = Arc::new(SyncMutex::new(Instant::now()));
        let task = tokio::spawn(run_subscription(
            self.exchange.clone(),
            symbol,
            interval,
            self.sink.clone(),
            last_seen.clone(),
            shutdown_rx,
        ));
        Subscription {
            last_seen,
            spawned_at: Instant::now(),
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Adds/removes subscriptions so the subscribed set matches `desired`
    /// exactly (spec §4.3 batch add/remove).
    pub async fn reconcile(&self, desired: &[(String, String)]) {
        let current = self.current_subscriptions().await;
        let desired_set: std::collections::HashSet<_> = desired.iter().cloned().collect();
        let to_add: Vec<_> = desired.iter().filter(|p| !current.contains(p)).cloned().collect();
        let to_remove: Vec<_> = current.into_iter().filter(|p| !desired_set.contains(p)).collect();
        if !to_add.is_empty() {
            self.add_subscriptions(&to_add).await;
        }
        if !to_remove.is_empty() {
            self.remove_subscriptions(&to_remove).await;
        }
    }

    /// Health-check + forced-rotation sweep (spec §4.3), run by the
    /// Scheduler Fabric's interval job every `kline_sync_check_interval_secs`.
    /// A stream with no traffic for `unhealthy_after`, or connected longer
    /// than 30 minutes, is torn down and resubscribed in place.
    pub async fn health_check_and_rotate(&self, unhealthy_after: Duration) {
        let mut subs = self.subs.lock().await;
        let keys: Vec<(String, String)> = subs.keys().cloned().collect();
        for key in keys {
            let needs_rotation = {
                let Some(sub) = subs.get(&key) else { continue };
                let idle = sub.last_seen.lock().elapsed() > unhealthy_after;
                let too_old = sub.spawned_at.elapsed() > FORCED_ROTATION_INTERVAL;
                idle || too_old
            };
            if !needs_rotation {
                continue;
            }
            if let Some(old) = subs.remove(&key) {
                let _ = old.shutdown.send(true);
                old.task.abort();
            }
            warn!(symbol = %key.0, interval = %key.1, "kline_subscription_rotated");
            let (symbol, interval) = key.clone();
            let fresh = self.spawn_subscription(symbol, interval);
            subs.insert(key, fresh);
        }
    }
}

async fn run_subscription(
    exchange: Arc<ExchangeGateway>,
    symbol: String,
    interval: String,
    sink: broadcast::Sender<FinalizedKline>,
    last_seen: Arc<SyncMutex<Instant>>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(symbol = %symbol, interval = %interval, "kline_subscription_started");
    let mut rx = exchange.subscribe_kline(&symbol, &interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(ev) => {
                        *last_seen.lock() = Instant::now();
                        if ev.kline.is_final {
                            let _ = sink.send(FinalizedKline {
                                symbol: ev.symbol,
                                interval: ev.kline.interval,
                                open_time: ev.kline.open_time,
                                open: ev.kline.open,
                                high: ev.kline.high,
                                low: ev.kline.low,
                                close: ev.kline.close,
                                volume: ev.kline.volume,
                            });
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_subscription_is_idempotent() {
        let exchange = Arc::new(ExchangeGateway::new("http://localhost", "ws://localhost"));
        let mgr = KlineStreamManager::new(exchange);
        mgr.add_subscriptions(&[("BTCUSDT".to_string(), "1m".to_string())]).await;
        mgr.add_subscriptions(&[("BTCUSDT".to_string(), "1m".to_string())]).await;
        assert_eq!(mgr.subs.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn remove_subscription_clears_entry() {
        let exchange = Arc::new(ExchangeGateway::new("http://localhost", "ws://localhost"));
        let mgr = KlineStreamManager::new(exchange);
        mgr.add_subscriptions(&[("BTCUSDT".to_string(), "1m".to_string())]).await;
        mgr.remove_subscriptions(&[("BTCUSDT".to_string(), "1m".to_string())]).await;
        assert!(mgr.subs.lock().await.is_empty());
    }
}
