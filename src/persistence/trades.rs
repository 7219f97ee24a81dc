//! CRUD for `trades` and `conversations` (spec §3, append-only rows).

use super::Db;
use crate::domain::{Conversation, Signal, Trade, TradeSide};
use rusqlite::{params, Row};

impl Db {
    pub async fn insert_trade(&self, t: &Trade) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO trades (id, model_id, symbol, side, signal, quantity, price, fee, pnl, timestamp)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                t.id,
                t.model_id,
                t.symbol,
                trade_side_str(t.side),
                t.signal.as_str(),
                t.quantity,
                t.price,
                t.fee,
                t.pnl,
                t.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn list_trades_for_model(&self, model_id: &str, limit: usize) -> anyhow::Result<Vec<Trade>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, model_id, symbol, side, signal, quantity, price, fee, pnl, timestamp
             FROM trades WHERE model_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![model_id, limit as i64], row_to_trade)?
            .filter_map(Result::ok)
            .collect();
        Ok(rows)
    }

    pub async fn insert_conversation(&self, c: &Conversation) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO conversations (id, model_id, timestamp, user_prompt, ai_response, cot_trace)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                c.id,
                c.model_id,
                c.timestamp.to_rfc3339(),
                c.user_prompt,
                c.ai_response,
                c.cot_trace
            ],
        )?;
        Ok(())
    }

    pub async fn list_conversations_for_model(
        &self,
        model_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<Conversation>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, model_id, timestamp, user_prompt, ai_response, cot_trace
             FROM conversations WHERE model_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![model_id, limit as i64], |row: &Row| {
                Ok(Conversation {
                    id: row.get(0)?,
                    model_id: row.get(1)?,
                    timestamp: super::parse_rfc3339(&row.get::<_, String>(2)?),
                    user_prompt: row.get(3)?,
                    ai_response: row.get(4)?,
                    cot_trace: row.get(5)?,
                })
            })?
            .filter_map(Result::ok)
            .collect();
        Ok(rows)
    }
}

fn trade_side_str(s: TradeSide) -> &'static str {
    match s {
        TradeSide::Buy => "buy",
        TradeSide::Sell => "sell",
    }
}

fn row_to_trade(row: &Row) -> rusqlite::Result<Trade> {
    let side: String = row.get(3)?;
    let signal: String = row.get(4)?;
    Ok(Trade {
        id: row.get(0)?,
        model_id: row.get(1)?,
        symbol: row.get(2)?,
        side: if side == "sell" { TradeSide::Sell } else { TradeSide::Buy },
        signal: Signal::parse(&signal).unwrap_or(Signal::ClosePosition),
        quantity: row.get(5)?,
        price: row.get(6)?,
        fee: row.get(7)?,
        pnl: row.get(8)?,
        timestamp: super::parse_rfc3339(&row.get::<_, String>(9)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn duplicate_trade_id_is_not_reinserted() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        let t = Trade {
            id: "t1".into(),
            model_id: "m1".into(),
            symbol: "BTCUSDT".into(),
            side: TradeSide::Buy,
            signal: Signal::BuyToLong,
            quantity: 1.0,
            price: 100.0,
            fee: 0.1,
            pnl: None,
            timestamp: Utc::now(),
        };
        db.insert_trade(&t).await.unwrap();
        db.insert_trade(&t).await.unwrap();
        let trades = db.list_trades_for_model("m1", 10).await.unwrap();
        assert_eq!(trades.len(), 1);
    }
}
