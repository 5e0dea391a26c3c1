use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::PgPool;
use std::collections::HashMap;

use crate::PersistResult;

#[derive(Debug, Clone)]
pub struct SettingRow {
    pub key: String,
    pub category: String,
    pub value: serde_json::Value,
}

/// Flat key/value settings store, grouped by `category` for the dashboard
/// settings screen.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> PersistResult<Option<SettingRow>>;
    async fn set(&self, row: &SettingRow) -> PersistResult<()>;
    async fn list_by_category(&self, category: &str) -> PersistResult<Vec<SettingRow>>;
    async fn delete(&self, key: &str) -> PersistResult<()>;
}

// ─── Postgres ─────────────────────────────────────────────────────────────────

pub struct PgSettingsStore {
    pool: PgPool,
}

impl PgSettingsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct Row {
    key: String,
    category: String,
    value: serde_json::Value,
}

impl From<Row> for SettingRow {
    fn from(r: Row) -> Self {
        SettingRow {
            key: r.key,
            category: r.category,
            value: r.value,
        }
    }
}

#[async_trait]
impl SettingsStore for PgSettingsStore {
    async fn get(&self, key: &str) -> PersistResult<Option<SettingRow>> {
        let row = sqlx::query_as::<_, Row>("SELECT * FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn set(&self, row: &SettingRow) -> PersistResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, category, value)
            VALUES ($1,$2,$3)
            ON CONFLICT (key) DO UPDATE SET category = EXCLUDED.category, value = EXCLUDED.value
            "#,
        )
        .bind(&row.key)
        .bind(&row.category)
        .bind(&row.value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_by_category(&self, category: &str) -> PersistResult<Vec<SettingRow>> {
        let rows = sqlx::query_as::<_, Row>("SELECT * FROM settings WHERE category = $1 ORDER BY key")
            .bind(category)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete(&self, key: &str) -> PersistResult<()> {
        sqlx::query("DELETE FROM settings WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ─── In-memory ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemorySettingsStore {
    settings: Mutex<HashMap<String, SettingRow>>,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn get(&self, key: &str) -> PersistResult<Option<SettingRow>> {
        Ok(self.settings.lock().get(key).cloned())
    }

    async fn set(&self, row: &SettingRow) -> PersistResult<()> {
        self.settings.lock().insert(row.key.clone(), row.clone());
        Ok(())
    }

    async fn list_by_category(&self, category: &str) -> PersistResult<Vec<SettingRow>> {
        Ok(self
            .settings
            .lock()
            .values()
            .filter(|r| r.category == category)
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> PersistResult<()> {
        self.settings.lock().remove(key);
        Ok(())
    }
}
