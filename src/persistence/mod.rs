//! Persistence Gateway (spec §4.9): the sole transactional boundary onto
//! the relational schema of §3. No raw SQL leaks above this module —
//! callers only see typed entities and typed operations.
//!
//! Grounded on `vault/vault_db.rs`: a `Connection` behind a
//! `tokio::sync::Mutex` (async-safe mutual exclusion around blocking
//! `rusqlite` calls, exactly as the teacher does it), schema creation in
//! `new()`, `ON CONFLICT ... DO UPDATE` upserts keyed on natural keys.

pub mod accounts;
pub mod algo_orders;
pub mod decisions;
pub mod futures_repo;
pub mod models_repo;
pub mod portfolios;
pub mod providers;
pub mod strategies;
pub mod tickers;
pub mod trades;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;

pub(crate) fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[derive(Clone)]
pub struct Db {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        Ok(db)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates every table the entities of spec §3 need. Idempotent.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS models (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                provider_id TEXT NOT NULL,
                provider_model_name TEXT NOT NULL,
                initial_capital REAL NOT NULL,
                leverage INTEGER NOT NULL,
                max_positions INTEGER NOT NULL,
                api_credentials TEXT,
                auto_buy_enabled INTEGER NOT NULL DEFAULT 0,
                auto_sell_enabled INTEGER NOT NULL DEFAULT 0,
                auto_close_percent REAL,
                base_volume_filter REAL,
                symbol_source TEXT NOT NULL DEFAULT 'leaderboard',
                batch_size INTEGER NOT NULL DEFAULT 5,
                batch_execution_interval_secs INTEGER NOT NULL DEFAULT 30,
                batch_execution_group_size INTEGER NOT NULL DEFAULT 1,
                sell_batch_size INTEGER NOT NULL DEFAULT 5,
                sell_batch_execution_interval_secs INTEGER NOT NULL DEFAULT 30,
                sell_batch_execution_group_size INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS providers (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                provider_type TEXT NOT NULL,
                base_url TEXT NOT NULL,
                api_key TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS futures (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                sort_order INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS strategies (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                strategy_type TEXT NOT NULL,
                program_text TEXT NOT NULL,
                metadata TEXT
            );

            CREATE TABLE IF NOT EXISTS model_strategies (
                id TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                strategy_type TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE(model_id, strategy_id, strategy_type)
            );
            CREATE INDEX IF NOT EXISTS idx_model_strategies_lookup
                ON model_strategies(model_id, strategy_type, priority DESC, created_at ASC);

            CREATE TABLE IF NOT EXISTS portfolios (
                model_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                avg_entry_price REAL NOT NULL,
                initial_margin REAL NOT NULL,
                leverage INTEGER NOT NULL,
                unrealized_pnl REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (model_id, symbol, side)
            );

            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                signal TEXT NOT NULL,
                quantity REAL NOT NULL,
                price REAL NOT NULL,
                fee REAL NOT NULL DEFAULT 0,
                pnl REAL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_model_ts ON trades(model_id, timestamp DESC);

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                user_prompt TEXT NOT NULL,
                ai_response TEXT NOT NULL,
                cot_trace TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_model_ts ON conversations(model_id, timestamp DESC);

            CREATE TABLE IF NOT EXISTS strategy_decisions (
                id TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                strategy_name TEXT NOT NULL,
                strategy_type TEXT NOT NULL,
                signal TEXT NOT NULL,
                symbol TEXT NOT NULL,
                quantity REAL NOT NULL,
                leverage INTEGER NOT NULL,
                price REAL,
                stop_price REAL,
                justification TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                trade_id TEXT,
                error_reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_decisions_model_status ON strategy_decisions(model_id, status);
            CREATE INDEX IF NOT EXISTS idx_decisions_created ON strategy_decisions(created_at);

            CREATE TABLE IF NOT EXISTS algo_orders (
                id TEXT PRIMARY KEY,
                external_algo_id TEXT,
                client_algo_id TEXT NOT NULL,
                algo_type TEXT NOT NULL,
                order_type TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                position_side TEXT NOT NULL,
                quantity REAL NOT NULL,
                trigger_price REAL NOT NULL,
                limit_price REAL,
                status TEXT NOT NULL,
                model_id TEXT NOT NULL,
                strategy_decision_id TEXT,
                trade_id TEXT,
                error_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_algo_orders_model_symbol_status
                ON algo_orders(model_id, symbol, status);

            CREATE TABLE IF NOT EXISTS account_values (
                model_id TEXT NOT NULL,
                account_alias TEXT NOT NULL,
                balance REAL NOT NULL,
                available_balance REAL NOT NULL,
                cross_wallet_balance REAL NOT NULL,
                cross_pnl REAL NOT NULL,
                cross_un_pnl REAL NOT NULL,
                timestamp TEXT NOT NULL,
                PRIMARY KEY (model_id, account_alias)
            );

            CREATE TABLE IF NOT EXISTS account_value_history (
                id TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                account_alias TEXT NOT NULL,
                balance REAL NOT NULL,
                available_balance REAL NOT NULL,
                cross_wallet_balance REAL NOT NULL,
                cross_un_pnl REAL NOT NULL,
                trade_id TEXT,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_avh_model_ts ON account_value_history(model_id, timestamp DESC);

            CREATE TABLE IF NOT EXISTS account_values_daily (
                id TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                balance REAL NOT NULL,
                available_balance REAL NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(model_id, created_at)
            );

            CREATE TABLE IF NOT EXISTS market_tickers (
                symbol TEXT PRIMARY KEY,
                last_price REAL NOT NULL,
                open_price REAL NOT NULL DEFAULT 0,
                price_change REAL,
                price_change_percent REAL,
                quote_volume REAL NOT NULL DEFAULT 0,
                base_volume REAL NOT NULL DEFAULT 0,
                event_time TEXT NOT NULL,
                ingestion_time TEXT NOT NULL,
                update_price_date TEXT,
                side TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_market_tickers_ingestion ON market_tickers(ingestion_time);
            CREATE INDEX IF NOT EXISTS idx_market_tickers_base_volume ON market_tickers(base_volume DESC);
            ",
        )?;
        Ok(())
    }

    /// Cascading model delete (spec §3, §4.9, §8 "cascade completeness"):
    /// removes every row owned by `model_id` before the Model row itself,
    /// in the order the gateway contract specifies.
    pub async fn delete_model(&self, model_id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let tx = conn.unchecked_transaction()?;
        for (table, column) in [
            ("algo_orders", "model_id"),
            ("strategy_decisions", "model_id"),
            ("trades", "model_id"),
            ("conversations", "model_id"),
            ("account_value_history", "model_id"),
            ("account_values_daily", "model_id"),
            ("account_values", "model_id"),
            ("portfolios", "model_id"),
            ("model_strategies", "model_id"),
        ] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE {column} = ?1"),
                rusqlite::params![model_id],
            )?;
        }
        tx.execute("DELETE FROM models WHERE id = ?1", rusqlite::params![model_id])?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        db.migrate().await.unwrap();
    }
}
