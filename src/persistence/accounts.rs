//! CRUD for `account_values`, `account_value_history` and
//! `account_values_daily` (spec §3, §4.8 auto-liquidation inputs).

use super::Db;
use crate::domain::{AccountValue, AccountValueHistory, AccountValuesDaily};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

/// Fixed UTC+8 offset used throughout the platform for "trading day" boundaries.
const UTC8_OFFSET_SECS: i64 = 8 * 3600;

pub fn to_utc8(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts + Duration::seconds(UTC8_OFFSET_SECS)
}

/// Canonical RFC3339 instant (UTC) for the start of the UTC+8 calendar day
/// that `ts` falls on. Used as the natural per-day key for
/// `account_values_daily` so `created_at` stays genuine RFC3339 while still
/// collapsing every write within the same UTC+8 day onto one row.
pub fn trading_day_key(ts: DateTime<Utc>) -> DateTime<Utc> {
    let shifted = to_utc8(ts);
    let midnight_utc8 = shifted.date_naive().and_hms_opt(0, 0, 0).unwrap();
    DateTime::<Utc>::from_naive_utc_and_offset(midnight_utc8, Utc) - Duration::seconds(UTC8_OFFSET_SECS)
}

impl Db {
    /// Natural key is `(model_id, account_alias)`: latest snapshot wins (spec §3).
    pub async fn upsert_account_value(&self, a: &AccountValue) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO account_values
                (model_id, account_alias, balance, available_balance, cross_wallet_balance,
                 cross_pnl, cross_un_pnl, timestamp)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
             ON CONFLICT(model_id, account_alias) DO UPDATE SET
                balance=excluded.balance,
                available_balance=excluded.available_balance,
                cross_wallet_balance=excluded.cross_wallet_balance,
                cross_pnl=excluded.cross_pnl,
                cross_un_pnl=excluded.cross_un_pnl,
                timestamp=excluded.timestamp",
            params![
                a.model_id,
                a.account_alias,
                a.balance,
                a.available_balance,
                a.cross_wallet_balance,
                a.cross_pnl,
                a.cross_un_pnl,
                a.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_account_value(
        &self,
        model_id: &str,
        account_alias: &str,
    ) -> anyhow::Result<Option<AccountValue>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT model_id, account_alias, balance, available_balance, cross_wallet_balance,
                    cross_pnl, cross_un_pnl, timestamp
             FROM account_values WHERE model_id = ?1 AND account_alias = ?2",
            params![model_id, account_alias],
            row_to_account_value,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Append-only audit trail; never updated or deduplicated (spec §3).
    pub async fn insert_account_value_history(&self, h: &AccountValueHistory) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO account_value_history
                (id, model_id, account_alias, balance, available_balance, cross_wallet_balance,
                 cross_un_pnl, trade_id, timestamp)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                h.id,
                h.model_id,
                h.account_alias,
                h.balance,
                h.available_balance,
                h.cross_wallet_balance,
                h.cross_un_pnl,
                h.trade_id,
                h.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn list_account_value_history(
        &self,
        model_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<AccountValueHistory>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, model_id, account_alias, balance, available_balance, cross_wallet_balance,
                    cross_un_pnl, trade_id, timestamp
             FROM account_value_history WHERE model_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![model_id, limit as i64], |row: &Row| {
                Ok(AccountValueHistory {
                    id: row.get(0)?,
                    model_id: row.get(1)?,
                    account_alias: row.get(2)?,
                    balance: row.get(3)?,
                    available_balance: row.get(4)?,
                    cross_wallet_balance: row.get(5)?,
                    cross_un_pnl: row.get(6)?,
                    trade_id: row.get(7)?,
                    timestamp: super::parse_rfc3339(&row.get::<_, String>(8)?),
                })
            })?
            .filter_map(Result::ok)
            .collect();
        Ok(rows)
    }

    /// One row per `(model_id, UTC+8 trading day)`: first write of the day
    /// creates the row, later writes within the same day update it in place.
    /// `created_at` stores the trading-day key as midnight UTC+8 converted
    /// back to UTC, so ordinary RFC3339 comparisons still sort by day.
    pub async fn upsert_account_value_daily(&self, model_id: &str, balance: f64, available_balance: f64, at: DateTime<Utc>) -> anyhow::Result<()> {
        let day_key = trading_day_key(at).to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO account_values_daily (id, model_id, balance, available_balance, created_at)
             VALUES (?1,?2,?3,?4,?5)
             ON CONFLICT(model_id, created_at) DO UPDATE SET
                balance=excluded.balance,
                available_balance=excluded.available_balance",
            params![Uuid::new_v4().to_string(), model_id, balance, available_balance, day_key],
        )?;
        Ok(())
    }

    pub async fn list_account_values_daily(
        &self,
        model_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<AccountValuesDaily>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, model_id, balance, available_balance, created_at
             FROM account_values_daily WHERE model_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![model_id, limit as i64], |row: &Row| {
                Ok(AccountValuesDaily {
                    id: row.get(0)?,
                    model_id: row.get(1)?,
                    balance: row.get(2)?,
                    available_balance: row.get(3)?,
                    created_at: super::parse_rfc3339(&row.get::<_, String>(4)?),
                })
            })?
            .filter_map(Result::ok)
            .collect();
        Ok(rows)
    }
}

fn row_to_account_value(row: &Row) -> rusqlite::Result<AccountValue> {
    Ok(AccountValue {
        model_id: row.get(0)?,
        account_alias: row.get(1)?,
        balance: row.get(2)?,
        available_balance: row.get(3)?,
        cross_wallet_balance: row.get(4)?,
        cross_pnl: row.get(5)?,
        cross_un_pnl: row.get(6)?,
        timestamp: super::parse_rfc3339(&row.get::<_, String>(7)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn account_value_upsert_keeps_single_row_per_alias() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        let mut av = AccountValue {
            model_id: "m1".into(),
            account_alias: "default".into(),
            balance: 1000.0,
            available_balance: 900.0,
            cross_wallet_balance: 1000.0,
            cross_pnl: 0.0,
            cross_un_pnl: 0.0,
            timestamp: Utc::now(),
        };
        db.upsert_account_value(&av).await.unwrap();
        av.balance = 1100.0;
        db.upsert_account_value(&av).await.unwrap();

        let got = db.get_account_value("m1", "default").await.unwrap().unwrap();
        assert_eq!(got.balance, 1100.0);
    }

    #[tokio::test]
    async fn daily_rollup_collapses_same_utc8_day() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();

        // 2026-01-01T23:00:00Z is 2026-01-02 in UTC+8.
        let morning = Utc.with_ymd_and_hms(2026, 1, 1, 23, 0, 0).unwrap();
        let later_same_utc8_day = Utc.with_ymd_and_hms(2026, 1, 2, 1, 0, 0).unwrap();

        db.upsert_account_value_daily("m1", 1000.0, 900.0, morning)
            .await
            .unwrap();
        db.upsert_account_value_daily("m1", 1200.0, 1100.0, later_same_utc8_day)
            .await
            .unwrap();

        let rows = db.list_account_values_daily("m1", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].balance, 1200.0);
    }
}
