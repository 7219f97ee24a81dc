//! CRUD for `strategy_decisions` (spec §3, §4.7 state machine, §8 monotonicity).

use super::Db;
use crate::domain::{DecisionStatus, Signal, StrategyDecision, StrategyType};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

impl Db {
    pub async fn insert_strategy_decision(&self, d: &StrategyDecision) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO strategy_decisions
                (id, model_id, strategy_name, strategy_type, signal, symbol, quantity, leverage,
                 price, stop_price, justification, status, created_at, trade_id, error_reason)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            params![
                d.id,
                d.model_id,
                d.strategy_name,
                strategy_type_str(d.strategy_type),
                d.signal.as_str(),
                d.symbol,
                d.quantity,
                d.leverage,
                d.price,
                d.stop_price,
                d.justification,
                status_str(d.status),
                d.created_at.to_rfc3339(),
                d.trade_id,
                d.error_reason,
            ],
        )?;
        Ok(())
    }

    pub async fn get_strategy_decision(&self, id: &str) -> anyhow::Result<Option<StrategyDecision>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, model_id, strategy_name, strategy_type, signal, symbol, quantity, leverage,
                    price, stop_price, justification, status, created_at, trade_id, error_reason
             FROM strategy_decisions WHERE id = ?1",
            params![id],
            row_to_decision,
        )
        .optional()
        .map_err(Into::into)
    }

    /// `TRIGGERED -> EXECUTED|REJECTED` only. Terminal states never mutate
    /// again (spec §8 decision monotonicity) — enforced here by gating the
    /// UPDATE on the current status still being `TRIGGERED`.
    pub async fn update_strategy_decision_status(
        &self,
        id: &str,
        status: DecisionStatus,
        trade_id: Option<&str>,
        error_reason: Option<&str>,
    ) -> anyhow::Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE strategy_decisions SET status = ?2, trade_id = COALESCE(?3, trade_id), error_reason = ?4
             WHERE id = ?1 AND status = 'TRIGGERED'",
            params![id, status_str(status), trade_id, error_reason],
        )?;
        Ok(n > 0)
    }

    pub async fn list_decisions_for_model(
        &self,
        model_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<StrategyDecision>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, model_id, strategy_name, strategy_type, signal, symbol, quantity, leverage,
                    price, stop_price, justification, status, created_at, trade_id, error_reason
             FROM strategy_decisions WHERE model_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![model_id, limit as i64], row_to_decision)?
            .filter_map(Result::ok)
            .collect();
        Ok(rows)
    }

    /// Strategy Decision Purge job (spec §6 scheduler knobs): drops
    /// terminal decisions older than `cutoff`, leaving anything still
    /// `TRIGGERED` untouched regardless of age.
    pub async fn delete_old_decisions(&self, cutoff: DateTime<Utc>) -> anyhow::Result<usize> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "DELETE FROM strategy_decisions WHERE status != 'TRIGGERED' AND created_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(n)
    }
}

fn status_str(s: DecisionStatus) -> &'static str {
    match s {
        DecisionStatus::Triggered => "TRIGGERED",
        DecisionStatus::Executed => "EXECUTED",
        DecisionStatus::Rejected => "REJECTED",
    }
}

fn strategy_type_str(t: StrategyType) -> &'static str {
    match t {
        StrategyType::Buy => "buy",
        StrategyType::Sell => "sell",
    }
}

fn row_to_decision(row: &Row) -> rusqlite::Result<StrategyDecision> {
    let strategy_type: String = row.get(3)?;
    let signal: String = row.get(4)?;
    let status: String = row.get(11)?;
    Ok(StrategyDecision {
        id: row.get(0)?,
        model_id: row.get(1)?,
        strategy_name: row.get(2)?,
        strategy_type: if strategy_type == "sell" {
            StrategyType::Sell
        } else {
            StrategyType::Buy
        },
        signal: Signal::parse(&signal).unwrap_or(Signal::ClosePosition),
        symbol: row.get(5)?,
        quantity: row.get(6)?,
        leverage: row.get(7)?,
        price: row.get(8)?,
        stop_price: row.get(9)?,
        justification: row.get(10)?,
        status: match status.as_str() {
            "EXECUTED" => DecisionStatus::Executed,
            "REJECTED" => DecisionStatus::Rejected,
            _ => DecisionStatus::Triggered,
        },
        created_at: super::parse_rfc3339(&row.get::<_, String>(12)?),
        trade_id: row.get(13)?,
        error_reason: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(id: &str) -> StrategyDecision {
        StrategyDecision {
            id: id.into(),
            model_id: "m1".into(),
            strategy_name: "s1".into(),
            strategy_type: StrategyType::Buy,
            signal: Signal::BuyToLong,
            symbol: "BTCUSDT".into(),
            quantity: 1.0,
            leverage: 10,
            price: Some(100.0),
            stop_price: None,
            justification: None,
            status: DecisionStatus::Triggered,
            created_at: Utc::now(),
            trade_id: None,
            error_reason: None,
        }
    }

    #[tokio::test]
    async fn terminal_state_does_not_transition_again() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        db.insert_strategy_decision(&sample("d1")).await.unwrap();

        let ok = db
            .update_strategy_decision_status("d1", DecisionStatus::Executed, Some("t1"), None)
            .await
            .unwrap();
        assert!(ok);

        // Second transition attempt must be a no-op (monotonicity, spec §8).
        let ok2 = db
            .update_strategy_decision_status("d1", DecisionStatus::Rejected, None, Some("late error"))
            .await
            .unwrap();
        assert!(!ok2);

        let d = db.get_strategy_decision("d1").await.unwrap().unwrap();
        assert_eq!(d.status, DecisionStatus::Executed);
        assert_eq!(d.trade_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn purge_skips_still_triggered_rows() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        let mut old = sample("old-triggered");
        old.created_at = Utc::now() - chrono::Duration::days(60);
        db.insert_strategy_decision(&old).await.unwrap();

        let mut old_rejected = sample("old-rejected");
        old_rejected.created_at = Utc::now() - chrono::Duration::days(60);
        db.insert_strategy_decision(&old_rejected).await.unwrap();
        db.update_strategy_decision_status("old-rejected", DecisionStatus::Rejected, None, Some("x"))
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(30);
        let deleted = db.delete_old_decisions(cutoff).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(db.get_strategy_decision("old-triggered").await.unwrap().is_some());
        assert!(db.get_strategy_decision("old-rejected").await.unwrap().is_none());
    }
}
