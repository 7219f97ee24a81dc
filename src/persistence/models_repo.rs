//! CRUD for the `models` table (spec §3 Model entity).

use super::Db;
use crate::domain::{BatchConfig, Model, SymbolSource};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

impl Db {
    pub async fn upsert_model(&self, m: &Model) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO models
                (id, display_name, provider_id, provider_model_name, initial_capital, leverage,
                 max_positions, api_credentials, auto_buy_enabled, auto_sell_enabled,
                 auto_close_percent, base_volume_filter, symbol_source,
                 batch_size, batch_execution_interval_secs, batch_execution_group_size,
                 sell_batch_size, sell_batch_execution_interval_secs, sell_batch_execution_group_size,
                 created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)
             ON CONFLICT(id) DO UPDATE SET
                display_name=excluded.display_name,
                provider_id=excluded.provider_id,
                provider_model_name=excluded.provider_model_name,
                initial_capital=excluded.initial_capital,
                leverage=excluded.leverage,
                max_positions=excluded.max_positions,
                api_credentials=excluded.api_credentials,
                auto_buy_enabled=excluded.auto_buy_enabled,
                auto_sell_enabled=excluded.auto_sell_enabled,
                auto_close_percent=excluded.auto_close_percent,
                base_volume_filter=excluded.base_volume_filter,
                symbol_source=excluded.symbol_source,
                batch_size=excluded.batch_size,
                batch_execution_interval_secs=excluded.batch_execution_interval_secs,
                batch_execution_group_size=excluded.batch_execution_group_size,
                sell_batch_size=excluded.sell_batch_size,
                sell_batch_execution_interval_secs=excluded.sell_batch_execution_interval_secs,
                sell_batch_execution_group_size=excluded.sell_batch_execution_group_size",
            params![
                m.id,
                m.display_name,
                m.provider_id,
                m.provider_model_name,
                m.initial_capital,
                m.leverage,
                m.max_positions,
                m.api_credentials,
                m.auto_buy_enabled,
                m.auto_sell_enabled,
                m.auto_close_percent,
                m.base_volume_filter,
                symbol_source_str(m.symbol_source),
                m.buy_batch.batch_size,
                m.buy_batch.batch_execution_interval_secs,
                m.buy_batch.batch_execution_group_size,
                m.sell_batch.batch_size,
                m.sell_batch.batch_execution_interval_secs,
                m.sell_batch.batch_execution_group_size,
                m.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_model(&self, id: &str) -> anyhow::Result<Option<Model>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM models WHERE id = ?1",
            params![id],
            row_to_model,
        )
        .optional()
        .map_err(Into::into)
    }

    pub async fn list_models(&self) -> anyhow::Result<Vec<Model>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT * FROM models ORDER BY created_at ASC")?;
        let rows = stmt
            .query_map([], row_to_model)?
            .filter_map(Result::ok)
            .collect();
        Ok(rows)
    }

    pub async fn list_enabled_models(&self) -> anyhow::Result<Vec<Model>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM models WHERE auto_buy_enabled = 1 OR auto_sell_enabled = 1
             ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], row_to_model)?
            .filter_map(Result::ok)
            .collect();
        Ok(rows)
    }

    pub async fn set_auto_enabled(
        &self,
        id: &str,
        buy: Option<bool>,
        sell: Option<bool>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        if let Some(b) = buy {
            conn.execute(
                "UPDATE models SET auto_buy_enabled = ?2 WHERE id = ?1",
                params![id, b],
            )?;
        }
        if let Some(s) = sell {
            conn.execute(
                "UPDATE models SET auto_sell_enabled = ?2 WHERE id = ?1",
                params![id, s],
            )?;
        }
        Ok(())
    }
}

fn symbol_source_str(s: SymbolSource) -> &'static str {
    match s {
        SymbolSource::Leaderboard => "leaderboard",
        SymbolSource::Future => "future",
    }
}

fn row_to_model(row: &Row) -> rusqlite::Result<Model> {
    let symbol_source: String = row.get("symbol_source")?;
    let created_at: String = row.get("created_at")?;
    Ok(Model {
        id: row.get("id")?,
        display_name: row.get("display_name")?,
        provider_id: row.get("provider_id")?,
        provider_model_name: row.get("provider_model_name")?,
        initial_capital: row.get("initial_capital")?,
        leverage: row.get("leverage")?,
        max_positions: row.get("max_positions")?,
        api_credentials: row.get("api_credentials")?,
        auto_buy_enabled: row.get("auto_buy_enabled")?,
        auto_sell_enabled: row.get("auto_sell_enabled")?,
        auto_close_percent: row.get("auto_close_percent")?,
        base_volume_filter: row.get("base_volume_filter")?,
        symbol_source: match symbol_source.as_str() {
            "future" => SymbolSource::Future,
            _ => SymbolSource::Leaderboard,
        },
        buy_batch: BatchConfig {
            batch_size: row.get("batch_size")?,
            batch_execution_interval_secs: row.get("batch_execution_interval_secs")?,
            batch_execution_group_size: row.get("batch_execution_group_size")?,
        },
        sell_batch: BatchConfig {
            batch_size: row.get("sell_batch_size")?,
            batch_execution_interval_secs: row.get("sell_batch_execution_interval_secs")?,
            batch_execution_group_size: row.get("sell_batch_execution_group_size")?,
        },
        created_at: crate::persistence::parse_rfc3339(&created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SymbolSource;

    fn sample(id: &str) -> Model {
        Model {
            id: id.into(),
            display_name: "m".into(),
            provider_id: "p1".into(),
            provider_model_name: "gpt-4".into(),
            initial_capital: 1000.0,
            leverage: 10,
            max_positions: 3,
            api_credentials: None,
            auto_buy_enabled: true,
            auto_sell_enabled: false,
            auto_close_percent: Some(50.0),
            base_volume_filter: None,
            symbol_source: SymbolSource::Leaderboard,
            buy_batch: BatchConfig::default(),
            sell_batch: BatchConfig::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_and_fetch_roundtrip() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        db.upsert_model(&sample("m1")).await.unwrap();
        let fetched = db.get_model("m1").await.unwrap().unwrap();
        assert_eq!(fetched.display_name, "m");
        assert!(fetched.auto_buy_enabled);
        assert_eq!(fetched.auto_close_percent, Some(50.0));
    }

    #[tokio::test]
    async fn list_enabled_models_filters_disabled() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        db.upsert_model(&sample("m1")).await.unwrap();
        let mut disabled = sample("m2");
        disabled.auto_buy_enabled = false;
        disabled.auto_sell_enabled = false;
        db.upsert_model(&disabled).await.unwrap();

        let enabled = db.list_enabled_models().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "m1");
    }
}
