use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use super::{KvStore, StorageResult};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS "kv_state" (
    "key" TEXT PRIMARY KEY NOT NULL,
    "value" TEXT NOT NULL,
    "updatedAt" TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)
"#;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        tracing::info!(path = %path.display(), "sqlite state store ready");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let raw: Option<String> =
            sqlx::query_scalar(r#"SELECT "value" FROM "kv_state" WHERE "key" = ?"#)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Value) -> StorageResult<()> {
        let raw = serde_json::to_string(&value)?;
        sqlx::query(
            r#"
            INSERT INTO "kv_state" ("key", "value", "updatedAt")
            VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            ON CONFLICT("key") DO UPDATE SET "value" = excluded."value", "updatedAt" = excluded."updatedAt"
            "#,
        )
        .bind(key)
        .bind(raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        sqlx::query(r#"DELETE FROM "kv_state" WHERE "key" = ?"#)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Value)>> {
        let rows = sqlx::query(
            r#"SELECT "key", "value" FROM "kv_state" WHERE substr("key", 1, length(?)) = ? ORDER BY "key""#,
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key")?;
            let raw: String = row.try_get("value")?;
            out.push((key, serde_json::from_str(&raw)?));
        }
        Ok(out)
    }

    async fn clear(&self) -> StorageResult<()> {
        sqlx::query(r#"DELETE FROM "kv_state""#)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::keys;
    use serde_json::json;

    #[tokio::test]
    async fn sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("session.db");

        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.put(&keys::progress_key("ephemeral"), json!({"stability": 2.4})).await.unwrap();
            store.put(&keys::progress_key("ephemeral"), json!({"stability": 4.7})).await.unwrap();
            store.put(keys::active_item_key(), json!("ephemeral")).await.unwrap();
            store.pool().close().await;
        }

        let store = SqliteStore::open(&path).await.unwrap();
        let progress = store.scan_prefix(keys::PROGRESS_PREFIX).await.unwrap();
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].1, json!({"stability": 4.7}));
        assert_eq!(store.get(keys::active_item_key()).await.unwrap(), Some(json!("ephemeral")));

        store.delete(keys::active_item_key()).await.unwrap();
        assert!(store.get(keys::active_item_key()).await.unwrap().is_none());

        store.clear().await.unwrap();
        assert!(store.scan_prefix("").await.unwrap().is_empty());
    }
}
