//! CRUD for `providers` and `futures` (spec §3, shared entities).

use super::Db;
use crate::domain::{Provider, ProviderType};
use rusqlite::{params, OptionalExtension, Row};

impl Db {
    pub async fn upsert_provider(&self, p: &Provider) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO providers (id, display_name, provider_type, base_url, api_key)
             VALUES (?1,?2,?3,?4,?5)
             ON CONFLICT(id) DO UPDATE SET
                display_name=excluded.display_name,
                provider_type=excluded.provider_type,
                base_url=excluded.base_url,
                api_key=excluded.api_key",
            params![
                p.id,
                p.display_name,
                provider_type_str(p.provider_type),
                p.base_url,
                p.api_key
            ],
        )?;
        Ok(())
    }

    pub async fn get_provider(&self, id: &str) -> anyhow::Result<Option<Provider>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, display_name, provider_type, base_url, api_key FROM providers WHERE id = ?1",
            params![id],
            row_to_provider,
        )
        .optional()
        .map_err(Into::into)
    }

    pub async fn list_providers(&self) -> anyhow::Result<Vec<Provider>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT id, display_name, provider_type, base_url, api_key FROM providers")?;
        let rows = stmt
            .query_map([], row_to_provider)?
            .filter_map(Result::ok)
            .collect();
        Ok(rows)
    }

    pub async fn delete_provider(&self, id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM providers WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn provider_type_str(t: ProviderType) -> &'static str {
    match t {
        ProviderType::Openai => "openai",
        ProviderType::AzureOpenai => "azure_openai",
        ProviderType::Deepseek => "deepseek",
        ProviderType::Anthropic => "anthropic",
        ProviderType::Gemini => "gemini",
        ProviderType::Other => "other",
    }
}

pub(crate) fn parse_provider_type(s: &str) -> ProviderType {
    match s {
        "openai" => ProviderType::Openai,
        "azure_openai" => ProviderType::AzureOpenai,
        "deepseek" => ProviderType::Deepseek,
        "anthropic" => ProviderType::Anthropic,
        "gemini" => ProviderType::Gemini,
        _ => ProviderType::Other,
    }
}

fn row_to_provider(row: &Row) -> rusqlite::Result<Provider> {
    let provider_type: String = row.get(2)?;
    Ok(Provider {
        id: row.get(0)?,
        display_name: row.get(1)?,
        provider_type: parse_provider_type(&provider_type),
        base_url: row.get(3)?,
        api_key: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn provider_roundtrip() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        let p = Provider {
            id: "p1".into(),
            display_name: "OpenAI".into(),
            provider_type: ProviderType::Openai,
            base_url: "https://api.openai.com".into(),
            api_key: "sk-x".into(),
        };
        db.upsert_provider(&p).await.unwrap();
        let fetched = db.get_provider("p1").await.unwrap().unwrap();
        assert_eq!(fetched.provider_type, ProviderType::Openai);
    }
}
