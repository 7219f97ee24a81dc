//! CRUD for `portfolios` (spec §3: quantity != 0 while row exists; deleted when closed).

use super::Db;
use crate::domain::{Portfolio, Side};
use rusqlite::{params, OptionalExtension, Row};

impl Db {
    pub async fn upsert_portfolio(&self, p: &Portfolio) -> anyhow::Result<()> {
        if p.quantity == 0.0 {
            return self.delete_portfolio(&p.model_id, &p.symbol, p.side).await;
        }
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO portfolios (model_id, symbol, side, quantity, avg_entry_price, initial_margin, leverage, unrealized_pnl)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
             ON CONFLICT(model_id, symbol, side) DO UPDATE SET
                quantity=excluded.quantity,
                avg_entry_price=excluded.avg_entry_price,
                initial_margin=excluded.initial_margin,
                leverage=excluded.leverage,
                unrealized_pnl=excluded.unrealized_pnl",
            params![
                p.model_id,
                p.symbol,
                side_str(p.side),
                p.quantity,
                p.avg_entry_price,
                p.initial_margin,
                p.leverage,
                p.unrealized_pnl
            ],
        )?;
        Ok(())
    }

    pub async fn get_portfolio(
        &self,
        model_id: &str,
        symbol: &str,
        side: Side,
    ) -> anyhow::Result<Option<Portfolio>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT model_id, symbol, side, quantity, avg_entry_price, initial_margin, leverage, unrealized_pnl
             FROM portfolios WHERE model_id = ?1 AND symbol = ?2 AND side = ?3",
            params![model_id, symbol, side_str(side)],
            row_to_portfolio,
        )
        .optional()
        .map_err(Into::into)
    }

    pub async fn list_portfolios_for_model(&self, model_id: &str) -> anyhow::Result<Vec<Portfolio>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT model_id, symbol, side, quantity, avg_entry_price, initial_margin, leverage, unrealized_pnl
             FROM portfolios WHERE model_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![model_id], row_to_portfolio)?
            .filter_map(Result::ok)
            .collect();
        Ok(rows)
    }

    /// Every open position across every model, joined against `auto_close_percent`
    /// in the caller (liquidation::scan) rather than here, to keep this gateway
    /// free of cross-entity business rules.
    pub async fn list_all_portfolios(&self) -> anyhow::Result<Vec<Portfolio>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT model_id, symbol, side, quantity, avg_entry_price, initial_margin, leverage, unrealized_pnl
             FROM portfolios WHERE quantity != 0",
        )?;
        let rows = stmt
            .query_map([], row_to_portfolio)?
            .filter_map(Result::ok)
            .collect();
        Ok(rows)
    }

    pub async fn delete_portfolio(
        &self,
        model_id: &str,
        symbol: &str,
        side: Side,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM portfolios WHERE model_id = ?1 AND symbol = ?2 AND side = ?3",
            params![model_id, symbol, side_str(side)],
        )?;
        Ok(())
    }
}

fn side_str(s: Side) -> &'static str {
    match s {
        Side::Long => "LONG",
        Side::Short => "SHORT",
    }
}

fn row_to_portfolio(row: &Row) -> rusqlite::Result<Portfolio> {
    let side: String = row.get(2)?;
    Ok(Portfolio {
        model_id: row.get(0)?,
        symbol: row.get(1)?,
        side: if side == "SHORT" { Side::Short } else { Side::Long },
        quantity: row.get(3)?,
        avg_entry_price: row.get(4)?,
        initial_margin: row.get(5)?,
        leverage: row.get(6)?,
        unrealized_pnl: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_quantity_upsert_deletes_row() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        let mut p = Portfolio {
            model_id: "m1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            quantity: 1.0,
            avg_entry_price: 100.0,
            initial_margin: 10.0,
            leverage: 10,
            unrealized_pnl: 0.0,
        };
        db.upsert_portfolio(&p).await.unwrap();
        assert!(db.get_portfolio("m1", "BTCUSDT", Side::Long).await.unwrap().is_some());

        p.quantity = 0.0;
        db.upsert_portfolio(&p).await.unwrap();
        assert!(db.get_portfolio("m1", "BTCUSDT", Side::Long).await.unwrap().is_none());
    }
}
