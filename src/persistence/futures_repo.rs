//! CRUD for `futures` (spec §3 Future entity, unique symbol).

use super::Db;
use crate::domain::Future;
use rusqlite::{params, Row};

impl Db {
    pub async fn upsert_future(&self, f: &Future) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO futures (id, symbol, display_name, sort_order)
             VALUES (?1,?2,?3,?4)
             ON CONFLICT(symbol) DO UPDATE SET
                display_name=excluded.display_name,
                sort_order=excluded.sort_order",
            params![f.id, f.symbol.to_uppercase(), f.display_name, f.sort_order],
        )?;
        Ok(())
    }

    pub async fn list_futures(&self) -> anyhow::Result<Vec<Future>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT id, symbol, display_name, sort_order FROM futures ORDER BY sort_order ASC")?;
        let rows = stmt
            .query_map([], row_to_future)?
            .filter_map(Result::ok)
            .collect();
        Ok(rows)
    }

    pub async fn delete_future(&self, id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM futures WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn row_to_future(row: &Row) -> rusqlite::Result<Future> {
    Ok(Future {
        id: row.get(0)?,
        symbol: row.get(1)?,
        display_name: row.get(2)?,
        sort_order: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn symbol_is_unique() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        db.upsert_future(&Future {
            id: "f1".into(),
            symbol: "btcusdt".into(),
            display_name: "Bitcoin".into(),
            sort_order: 0,
        })
        .await
        .unwrap();
        db.upsert_future(&Future {
            id: "f1".into(),
            symbol: "BTCUSDT".into(),
            display_name: "Bitcoin Perp".into(),
            sort_order: 1,
        })
        .await
        .unwrap();
        let list = db.list_futures().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].display_name, "Bitcoin Perp");
    }
}
