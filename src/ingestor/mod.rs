//! Market Ticker Ingestor (spec §4.2): consumes the all-symbols ticker
//! stream, filters to USDT-quoted symbols, and keeps `market_tickers`
//! fresh without ever clobbering the `open_price`/`update_price_date`
//! anchor columns. Price Refresh and Cleanup run as separate scheduled
//! jobs driven by the Scheduler Fabric.
//!
//! Grounded on `scrapers/binance_price_feed.rs`'s `BinancePriceFeed`
//! (per-symbol state update from a broadcast ticker feed), generalized
//! from spot mid-price tracking to the 24h ticker payload and batched
//! persistence upsert.

use crate::exchange::ExchangeGateway;
use crate::persistence::tickers::TickerUpdate;
use crate::persistence::Db;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

const UPSERT_BATCH_SIZE: usize = 200;
const PRICE_REFRESH_MAX_AGE: ChronoDuration = ChronoDuration::hours(1);

pub struct Ingestor {
    db: Db,
    exchange: Arc<ExchangeGateway>,
}

impl Ingestor {
    pub fn new(db: Db, exchange: Arc<ExchangeGateway>) -> Self {
        Self { db, exchange }
    }

    /// Single ingestor task (spec §4.2 concurrency note): one subscription,
    /// reconnect-and-resume without replay is the WS layer's job, not ours.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut rx = self.exchange.subscribe_all_tickers();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                batch = rx.recv() => {
                    match batch {
                        Ok(events) => {
                            if let Err(e) = self.ingest_batch(events).await {
                                error!(error = %e, "ticker_ingest_batch_failed");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "ticker_ingest_lagged_dropping_skipped_batches");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn ingest_batch(&self, events: Vec<crate::exchange::ws::TickerEvent>) -> anyhow::Result<()> {
        let updates: Vec<TickerUpdate> = events
            .into_iter()
            .filter(|e| e.symbol.ends_with("USDT"))
            .map(|e| TickerUpdate {
                symbol: e.symbol,
                last_price: e.last_price,
                quote_volume: e.quote_volume,
                base_volume: e.base_volume,
                event_time: DateTime::from_timestamp_millis(e.event_time).unwrap_or_else(Utc::now),
            })
            .collect();

        for chunk in updates.chunks(UPSERT_BATCH_SIZE) {
            self.db.upsert_market_tickers(chunk).await?;
        }
        Ok(())
    }

    /// Price Refresh scheduled job (spec §4.2): symbols whose
    /// `update_price_date` is null or older than 1h in UTC+8 get a fresh
    /// reference price (last 1m kline close) via REST.
    pub async fn refresh_open_prices(&self) -> anyhow::Result<()> {
        let now_utc8 = crate::persistence::accounts::to_utc8(Utc::now());
        let symbols = self
            .db
            .select_symbols_needing_price_refresh(now_utc8, PRICE_REFRESH_MAX_AGE)
            .await?;
        for symbol in symbols {
            match self.exchange.fetch_klines(&symbol, "1m", 1, None, None).await {
                Ok(klines) => {
                    let Some(last) = klines.last() else { continue };
                    self.db.update_open_price(&symbol, last.close, now_utc8).await?;
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "open_price_refresh_failed");
                }
            }
        }
        Ok(())
    }

    /// Cleanup scheduled job (spec §4.2): drops rows older than
    /// `retention_days` by `ingestion_time`.
    pub async fn cleanup_old_tickers(&self, retention_days: i64) -> anyhow::Result<()> {
        let cutoff = Utc::now() - ChronoDuration::days(retention_days);
        let deleted = self.db.delete_old_tickers(cutoff).await?;
        if deleted > 0 {
            info!(deleted, "ticker_cleanup_completed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ws::TickerEvent;

    fn sample_event(symbol: &str) -> TickerEvent {
        TickerEvent {
            symbol: symbol.to_string(),
            last_price: 100.0,
            price_change_percent: 1.0,
            quote_volume: 1_000_000.0,
            base_volume: 10_000.0,
            event_time: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn ingest_batch_filters_non_usdt_symbols() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        let exchange = Arc::new(ExchangeGateway::new("http://localhost", "ws://localhost"));
        let ingestor = Ingestor::new(db.clone(), exchange);

        ingestor
            .ingest_batch(vec![sample_event("BTCUSDT"), sample_event("BTCBUSD")])
            .await
            .unwrap();

        assert!(db.get_market_ticker("BTCUSDT").await.unwrap().is_some());
        assert!(db.get_market_ticker("BTCBUSD").await.unwrap().is_none());
    }
}
