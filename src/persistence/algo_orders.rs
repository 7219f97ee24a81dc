//! CRUD for `algo_orders` (spec §3, §4.7 algo-order state machine and
//! supersession rules).

use super::Db;
use crate::domain::{AlgoOrder, AlgoStatus, AlgoType, Side, TradeSide};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

impl Db {
    pub async fn insert_algo_order(&self, a: &AlgoOrder) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO algo_orders
                (id, external_algo_id, client_algo_id, algo_type, order_type, symbol, side,
                 position_side, quantity, trigger_price, limit_price, status, model_id,
                 strategy_decision_id, trade_id, error_reason, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
            params![
                a.id,
                a.external_algo_id,
                a.client_algo_id,
                algo_type_str(a.algo_type),
                a.order_type,
                a.symbol,
                trade_side_str(a.side),
                side_str(a.position_side),
                a.quantity,
                a.trigger_price,
                a.limit_price,
                status_str(a.status),
                a.model_id,
                a.strategy_decision_id,
                a.trade_id,
                a.error_reason,
                a.created_at.to_rfc3339(),
                a.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_algo_order(&self, id: &str) -> anyhow::Result<Option<AlgoOrder>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, external_algo_id, client_algo_id, algo_type, order_type, symbol, side,
                    position_side, quantity, trigger_price, limit_price, status, model_id,
                    strategy_decision_id, trade_id, error_reason, created_at, updated_at
             FROM algo_orders WHERE id = ?1",
            params![id],
            row_to_algo,
        )
        .optional()
        .map_err(Into::into)
    }

    /// All `NEW` algo orders for a `(model, symbol)` pair, used both by the
    /// supersession rule (cancel older NEW algos when a fresh one is placed)
    /// and by the supervisor loop's fill/trigger polling.
    pub async fn select_new_algo_orders_by(
        &self,
        model_id: &str,
        symbol: &str,
    ) -> anyhow::Result<Vec<AlgoOrder>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, external_algo_id, client_algo_id, algo_type, order_type, symbol, side,
                    position_side, quantity, trigger_price, limit_price, status, model_id,
                    strategy_decision_id, trade_id, error_reason, created_at, updated_at
             FROM algo_orders WHERE model_id = ?1 AND symbol = ?2 AND status = 'NEW'
             ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![model_id, symbol], row_to_algo)?
            .filter_map(Result::ok)
            .collect();
        Ok(rows)
    }

    pub async fn update_algo_status(
        &self,
        id: &str,
        status: AlgoStatus,
        error_reason: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE algo_orders SET status = ?2, error_reason = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, status_str(status), error_reason, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn update_trade_id_and_status(
        &self,
        id: &str,
        trade_id: &str,
        status: AlgoStatus,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE algo_orders SET trade_id = ?2, status = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, trade_id, status_str(status), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Cancels every `NEW` algo order for `(model, symbol)` other than `keep_id`
    /// (spec §9 decision: a fresh NEW algo supersedes older NEW algos for the
    /// same symbol regardless of side or algo type).
    pub async fn supersede_new_algo_orders(
        &self,
        model_id: &str,
        symbol: &str,
        keep_id: &str,
    ) -> anyhow::Result<usize> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE algo_orders SET status = 'CANCELLED', updated_at = ?4
             WHERE model_id = ?1 AND symbol = ?2 AND status = 'NEW' AND id != ?3",
            params![model_id, symbol, keep_id, Utc::now().to_rfc3339()],
        )?;
        Ok(n)
    }

    /// Every `NEW` algo order across every model (spec §4.7 supervisor loop scan).
    pub async fn list_all_new_algo_orders(&self) -> anyhow::Result<Vec<AlgoOrder>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, external_algo_id, client_algo_id, algo_type, order_type, symbol, side,
                    position_side, quantity, trigger_price, limit_price, status, model_id,
                    strategy_decision_id, trade_id, error_reason, created_at, updated_at
             FROM algo_orders WHERE status = 'NEW' ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], row_to_algo)?
            .filter_map(Result::ok)
            .collect();
        Ok(rows)
    }

    pub async fn list_algo_orders_for_model(&self, model_id: &str) -> anyhow::Result<Vec<AlgoOrder>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, external_algo_id, client_algo_id, algo_type, order_type, symbol, side,
                    position_side, quantity, trigger_price, limit_price, status, model_id,
                    strategy_decision_id, trade_id, error_reason, created_at, updated_at
             FROM algo_orders WHERE model_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![model_id], row_to_algo)?
            .filter_map(Result::ok)
            .collect();
        Ok(rows)
    }
}

fn status_str(s: AlgoStatus) -> &'static str {
    match s {
        AlgoStatus::New => "NEW",
        AlgoStatus::Cancelled => "CANCELLED",
        AlgoStatus::Filled => "FILLED",
    }
}

fn algo_type_str(t: AlgoType) -> &'static str {
    match t {
        AlgoType::Stop => "STOP",
        AlgoType::TakeProfit => "TAKE_PROFIT",
    }
}

fn trade_side_str(s: TradeSide) -> &'static str {
    match s {
        TradeSide::Buy => "buy",
        TradeSide::Sell => "sell",
    }
}

fn side_str(s: Side) -> &'static str {
    match s {
        Side::Long => "LONG",
        Side::Short => "SHORT",
    }
}

fn row_to_algo(row: &Row) -> rusqlite::Result<AlgoOrder> {
    let algo_type: String = row.get(3)?;
    let side: String = row.get(6)?;
    let position_side: String = row.get(7)?;
    let status: String = row.get(11)?;
    Ok(AlgoOrder {
        id: row.get(0)?,
        external_algo_id: row.get(1)?,
        client_algo_id: row.get(2)?,
        algo_type: if algo_type == "TAKE_PROFIT" {
            AlgoType::TakeProfit
        } else {
            AlgoType::Stop
        },
        order_type: row.get(4)?,
        symbol: row.get(5)?,
        side: if side == "sell" { TradeSide::Sell } else { TradeSide::Buy },
        position_side: if position_side == "SHORT" { Side::Short } else { Side::Long },
        quantity: row.get(8)?,
        trigger_price: row.get(9)?,
        limit_price: row.get(10)?,
        status: match status.as_str() {
            "CANCELLED" => AlgoStatus::Cancelled,
            "FILLED" => AlgoStatus::Filled,
            _ => AlgoStatus::New,
        },
        model_id: row.get(12)?,
        strategy_decision_id: row.get(13)?,
        trade_id: row.get(14)?,
        error_reason: row.get(15)?,
        created_at: super::parse_rfc3339(&row.get::<_, String>(16)?),
        updated_at: super::parse_rfc3339(&row.get::<_, String>(17)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, symbol: &str) -> AlgoOrder {
        let now = Utc::now();
        AlgoOrder {
            id: id.into(),
            external_algo_id: None,
            client_algo_id: format!("client-{id}"),
            algo_type: AlgoType::Stop,
            order_type: "STOP_MARKET".into(),
            symbol: symbol.into(),
            side: TradeSide::Sell,
            position_side: Side::Long,
            quantity: 1.0,
            trigger_price: 90.0,
            limit_price: None,
            status: AlgoStatus::New,
            model_id: "m1".into(),
            strategy_decision_id: None,
            trade_id: None,
            error_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn supersession_cancels_older_new_orders_same_symbol() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        db.insert_algo_order(&sample("a1", "BTCUSDT")).await.unwrap();
        db.insert_algo_order(&sample("a2", "BTCUSDT")).await.unwrap();
        db.insert_algo_order(&sample("a3", "ETHUSDT")).await.unwrap();

        let cancelled = db
            .supersede_new_algo_orders("m1", "BTCUSDT", "a2")
            .await
            .unwrap();
        assert_eq!(cancelled, 1);

        let a1 = db.get_algo_order("a1").await.unwrap().unwrap();
        assert_eq!(a1.status, AlgoStatus::Cancelled);
        let a2 = db.get_algo_order("a2").await.unwrap().unwrap();
        assert_eq!(a2.status, AlgoStatus::New);
        let a3 = db.get_algo_order("a3").await.unwrap().unwrap();
        assert_eq!(a3.status, AlgoStatus::New);
    }

    #[tokio::test]
    async fn fill_sets_trade_id_and_status() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        db.insert_algo_order(&sample("a1", "BTCUSDT")).await.unwrap();
        db.update_trade_id_and_status("a1", "t1", AlgoStatus::Filled)
            .await
            .unwrap();
        let a1 = db.get_algo_order("a1").await.unwrap().unwrap();
        assert_eq!(a1.status, AlgoStatus::Filled);
        assert_eq!(a1.trade_id.as_deref(), Some("t1"));
    }
}
