//! Market ticker upserts and the price-refresh/cleanup queries (spec §4.2, §4.9).

use super::Db;
use crate::domain::{MarketTicker, Side};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

/// One ticker update as delivered by the exchange's all-symbol stream
/// (spec §4.2): `lastPrice`, `priceChangePercent` (recomputed, not trusted
/// from the wire), volumes, and event time. `open_price` is never part of
/// this shape — it is exclusively owned by the price-refresh job.
#[derive(Debug, Clone)]
pub struct TickerUpdate {
    pub symbol: String,
    pub last_price: f64,
    pub quote_volume: f64,
    pub base_volume: f64,
    pub event_time: DateTime<Utc>,
}

impl Db {
    /// Batched upsert keyed on `symbol`. Never writes `open_price` or
    /// `update_price_date` — those columns are preserved across this path
    /// (spec §4.2 "open-price preservation", tested in §8).
    pub async fn upsert_market_tickers(&self, batch: &[TickerUpdate]) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().await;
        let tx = conn.unchecked_transaction()?;
        let now = Utc::now();
        for t in batch {
            // Existing open_price, if any, to compute price_change/_percent.
            let existing_open: Option<f64> = tx
                .query_row(
                    "SELECT open_price FROM market_tickers WHERE symbol = ?1",
                    params![t.symbol],
                    |r| r.get(0),
                )
                .optional()?;

            let open_price = existing_open.unwrap_or(0.0);
            let (price_change, price_change_percent) = if open_price > 0.0 {
                let change = t.last_price - open_price;
                (Some(change), Some(change / open_price * 100.0))
            } else {
                (None, None)
            };
            let side = if price_change_percent.unwrap_or(0.0) >= 0.0 {
                Side::Long
            } else {
                Side::Short
            };

            tx.execute(
                "INSERT INTO market_tickers
                    (symbol, last_price, open_price, price_change, price_change_percent,
                     quote_volume, base_volume, event_time, ingestion_time, update_price_date, side)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                    (SELECT update_price_date FROM market_tickers WHERE symbol = ?1), ?10)
                 ON CONFLICT(symbol) DO UPDATE SET
                    last_price = excluded.last_price,
                    price_change = excluded.price_change,
                    price_change_percent = excluded.price_change_percent,
                    quote_volume = excluded.quote_volume,
                    base_volume = excluded.base_volume,
                    event_time = excluded.event_time,
                    ingestion_time = excluded.ingestion_time,
                    side = excluded.side",
                params![
                    t.symbol,
                    t.last_price,
                    open_price,
                    price_change,
                    price_change_percent,
                    t.quote_volume,
                    t.base_volume,
                    t.event_time.to_rfc3339(),
                    now.to_rfc3339(),
                    side_str(side),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Symbols whose `update_price_date` is null or older than `max_age` relative
    /// to `now_utc8` (spec §4.2 scenario 2).
    pub async fn select_symbols_needing_price_refresh(
        &self,
        now_utc8: DateTime<Utc>,
        max_age: chrono::Duration,
    ) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let cutoff = (now_utc8 - max_age).to_rfc3339();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol FROM market_tickers
             WHERE update_price_date IS NULL OR update_price_date < ?1
             ORDER BY symbol ASC",
        )?;
        let rows = stmt
            .query_map(params![cutoff], |r| r.get::<_, String>(0))?
            .filter_map(Result::ok)
            .collect();
        Ok(rows)
    }

    /// Sets `open_price` and bumps `update_price_date` to `now_utc8`. The
    /// only writer of these two columns (spec §4.2, §5 ordering guarantee).
    pub async fn update_open_price(
        &self,
        symbol: &str,
        price: f64,
        now_utc8: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE market_tickers SET open_price = ?2, update_price_date = ?3 WHERE symbol = ?1",
            params![symbol, price, now_utc8.to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn delete_old_tickers(&self, cutoff: DateTime<Utc>) -> anyhow::Result<usize> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "DELETE FROM market_tickers WHERE ingestion_time < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(n)
    }

    pub async fn get_market_ticker(&self, symbol: &str) -> anyhow::Result<Option<MarketTicker>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT symbol, last_price, open_price, price_change, price_change_percent,
                    quote_volume, base_volume, event_time, ingestion_time, update_price_date, side
             FROM market_tickers WHERE symbol = ?1",
            params![symbol],
            row_to_ticker,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Top-N by `price_change_percent` desc, filtered by a minimum
    /// `base_volume` (spec §4.6 leaderboard candidate construction).
    pub async fn top_gainers(
        &self,
        limit: usize,
        min_base_volume: Option<f64>,
    ) -> anyhow::Result<Vec<MarketTicker>> {
        let conn = self.conn.lock().await;
        let min_vol = min_base_volume.unwrap_or(0.0);
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, last_price, open_price, price_change, price_change_percent,
                    quote_volume, base_volume, event_time, ingestion_time, update_price_date, side
             FROM market_tickers
             WHERE base_volume >= ?1
             ORDER BY price_change_percent DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![min_vol, limit as i64], row_to_ticker)?
            .filter_map(Result::ok)
            .collect();
        Ok(rows)
    }
}

fn side_str(s: Side) -> &'static str {
    match s {
        Side::Long => "long",
        Side::Short => "short",
    }
}

fn row_to_ticker(row: &rusqlite::Row) -> rusqlite::Result<MarketTicker> {
    let side: Option<String> = row.get(10)?;
    let update_price_date: Option<String> = row.get(9)?;
    Ok(MarketTicker {
        symbol: row.get(0)?,
        last_price: row.get(1)?,
        open_price: row.get(2)?,
        price_change: row.get(3)?,
        price_change_percent: row.get(4)?,
        quote_volume: row.get(5)?,
        base_volume: row.get(6)?,
        event_time: parse_dt(row.get::<_, String>(7)?),
        ingestion_time: parse_dt(row.get::<_, String>(8)?),
        update_price_date: update_price_date.map(parse_dt),
        side: side.and_then(|s| match s.as_str() {
            "long" => Some(Side::Long),
            "short" => Some(Side::Short),
            _ => None,
        }),
    })
}

fn parse_dt(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn setup() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn open_price_anchor_preserved_across_upserts() {
        let db = setup().await;
        {
            let conn = db.conn.lock().await;
            conn.execute(
                "INSERT INTO market_tickers (symbol, last_price, open_price, quote_volume, base_volume, event_time, ingestion_time, update_price_date)
                 VALUES ('BTCUSDT', 50000, 50000, 0, 0, ?1, ?1, ?2)",
                params![
                    Utc::now().to_rfc3339(),
                    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap().to_rfc3339()
                ],
            ).unwrap();
        }

        db.upsert_market_tickers(&[TickerUpdate {
            symbol: "BTCUSDT".into(),
            last_price: 51000.0,
            quote_volume: 1.0,
            base_volume: 1.0,
            event_time: Utc::now(),
        }])
        .await
        .unwrap();

        let t = db.get_market_ticker("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(t.open_price, 50000.0);
        assert_eq!(t.last_price, 51000.0);
        assert!((t.price_change_percent.unwrap() - 2.0).abs() < 1e-9);
        assert_eq!(
            t.update_price_date.unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn upsert_idempotence() {
        let db = setup().await;
        let batch = vec![TickerUpdate {
            symbol: "ETHUSDT".into(),
            last_price: 3000.0,
            quote_volume: 10.0,
            base_volume: 5.0,
            event_time: Utc::now(),
        }];
        db.upsert_market_tickers(&batch).await.unwrap();
        db.upsert_market_tickers(&batch).await.unwrap();

        let conn = db.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM market_tickers WHERE symbol = 'ETHUSDT'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn price_refresh_eligibility() {
        let db = setup().await;
        {
            let conn = db.conn.lock().await;
            conn.execute(
                "INSERT INTO market_tickers (symbol, last_price, open_price, quote_volume, base_volume, event_time, ingestion_time, update_price_date)
                 VALUES ('BTCUSDT', 1, 1, 0, 0, ?1, ?1, ?2)",
                params![Utc::now().to_rfc3339(), Utc.with_ymd_and_hms(2026,1,1,0,30,0).unwrap().to_rfc3339()],
            ).unwrap();
            conn.execute(
                "INSERT INTO market_tickers (symbol, last_price, open_price, quote_volume, base_volume, event_time, ingestion_time, update_price_date)
                 VALUES ('ETHUSDT', 1, 0, 0, 0, ?1, ?1, NULL)",
                params![Utc::now().to_rfc3339()],
            ).unwrap();
        }

        let now = Utc.with_ymd_and_hms(2026, 1, 1, 2, 0, 0).unwrap();
        let needing = db
            .select_symbols_needing_price_refresh(now, chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(!needing.contains(&"BTCUSDT".to_string()));
        assert!(needing.contains(&"ETHUSDT".to_string()));
    }
}
