//! CRUD for `strategies` and `model_strategies` (spec §3, §4.5 strategy resolution).

use super::Db;
use crate::domain::{ModelStrategy, Strategy, StrategyType};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

impl Db {
    pub async fn upsert_strategy(&self, s: &Strategy) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO strategies (id, name, strategy_type, program_text, metadata)
             VALUES (?1,?2,?3,?4,?5)
             ON CONFLICT(id) DO UPDATE SET
                name=excluded.name,
                strategy_type=excluded.strategy_type,
                program_text=excluded.program_text,
                metadata=excluded.metadata",
            params![
                s.id,
                s.name,
                strategy_type_str(s.strategy_type),
                s.program_text,
                s.metadata
            ],
        )?;
        Ok(())
    }

    pub async fn get_strategy(&self, id: &str) -> anyhow::Result<Option<Strategy>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, name, strategy_type, program_text, metadata FROM strategies WHERE id = ?1",
            params![id],
            row_to_strategy,
        )
        .optional()
        .map_err(Into::into)
    }

    pub async fn add_model_strategy(&self, ms: &ModelStrategy) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO model_strategies (id, model_id, strategy_id, strategy_type, priority, created_at)
             VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(model_id, strategy_id, strategy_type) DO UPDATE SET
                priority = excluded.priority",
            params![
                ms.id,
                ms.model_id,
                ms.strategy_id,
                strategy_type_str(ms.strategy_type),
                ms.priority,
                ms.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn list_strategies(&self) -> anyhow::Result<Vec<Strategy>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT id, name, strategy_type, program_text, metadata FROM strategies ORDER BY name ASC")?;
        let rows = stmt.query_map([], row_to_strategy)?.filter_map(Result::ok).collect();
        Ok(rows)
    }

    pub async fn delete_strategy(&self, id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM model_strategies WHERE strategy_id = ?1", params![id])?;
        conn.execute("DELETE FROM strategies WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// `(modelId, side)` → ordered list by priority desc then created asc (spec §4.5).
    pub async fn strategies_for_model(
        &self,
        model_id: &str,
        strategy_type: StrategyType,
    ) -> anyhow::Result<Vec<Strategy>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT s.id, s.name, s.strategy_type, s.program_text, s.metadata
             FROM model_strategies ms
             JOIN strategies s ON s.id = ms.strategy_id
             WHERE ms.model_id = ?1 AND ms.strategy_type = ?2
             ORDER BY ms.priority DESC, ms.created_at ASC",
        )?;
        let rows = stmt
            .query_map(
                params![model_id, strategy_type_str(strategy_type)],
                row_to_strategy,
            )?
            .filter_map(Result::ok)
            .collect();
        Ok(rows)
    }
}

fn strategy_type_str(t: StrategyType) -> &'static str {
    match t {
        StrategyType::Buy => "buy",
        StrategyType::Sell => "sell",
    }
}

fn row_to_strategy(row: &Row) -> rusqlite::Result<Strategy> {
    let strategy_type: String = row.get(2)?;
    Ok(Strategy {
        id: row.get(0)?,
        name: row.get(1)?,
        strategy_type: match strategy_type.as_str() {
            "sell" => StrategyType::Sell,
            _ => StrategyType::Buy,
        },
        program_text: row.get(3)?,
        metadata: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ordered_by_priority_desc_then_created_asc() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();

        for (id, name, priority) in [("s1", "low", 1), ("s2", "high", 10), ("s3", "mid", 5)] {
            db.upsert_strategy(&Strategy {
                id: id.into(),
                name: name.into(),
                strategy_type: StrategyType::Buy,
                program_text: "ACTION=BUY".into(),
                metadata: None,
            })
            .await
            .unwrap();
            db.add_model_strategy(&ModelStrategy {
                id: format!("ms-{id}"),
                model_id: "m1".into(),
                strategy_id: id.into(),
                strategy_type: StrategyType::Buy,
                priority,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        }

        let ordered = db
            .strategies_for_model("m1", StrategyType::Buy)
            .await
            .unwrap();
        let names: Vec<_> = ordered.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["high", "mid", "low"]);
    }
}
