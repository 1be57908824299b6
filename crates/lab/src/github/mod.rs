//! GitHub integration settings (singleton row).
//!
//! Credential storage internals are an external collaborator's concern;
//! this module only persists the opaque settings document and answers
//! whether integration is configured.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;

/// Response shape for `GET /github/settings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubSettings {
    pub configured: bool,
    #[serde(flatten)]
    pub settings: Value,
}

/// Repository for the `github_settings` singleton.
#[derive(Debug, Clone)]
pub struct GithubSettingsRepository {
    pool: SqlitePool,
}

impl GithubSettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self) -> Result<GithubSettings> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT settings FROM github_settings WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .context("fetching github settings")?;

        match row {
            Some((raw,)) => Ok(GithubSettings {
                configured: true,
                settings: serde_json::from_str(&raw).context("parsing github settings")?,
            }),
            None => Ok(GithubSettings {
                configured: false,
                settings: Value::Object(Default::default()),
            }),
        }
    }

    pub async fn upsert(&self, settings: &Value) -> Result<GithubSettings> {
        let raw = serde_json::to_string(settings).context("serializing github settings")?;
        sqlx::query(
            r#"
            INSERT INTO github_settings (id, settings, updated_at) VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET settings = excluded.settings, updated_at = excluded.updated_at
            "#,
        )
        .bind(&raw)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("saving github settings")?;

        Ok(GithubSettings {
            configured: true,
            settings: settings.clone(),
        })
    }

    pub async fn delete(&self) -> Result<()> {
        sqlx::query("DELETE FROM github_settings WHERE id = 1")
            .execute(&self.pool)
            .await
            .context("deleting github settings")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    #[tokio::test]
    async fn singleton_lifecycle() {
        let db = Database::in_memory().await.unwrap();
        let repo = GithubSettingsRepository::new(db.pool().clone());

        assert!(!repo.get().await.unwrap().configured);

        repo.upsert(&json!({"owner": "lab", "repo": "demo"}))
            .await
            .unwrap();
        let settings = repo.get().await.unwrap();
        assert!(settings.configured);
        assert_eq!(settings.settings["owner"], "lab");

        // Upsert replaces, not duplicates.
        repo.upsert(&json!({"owner": "other"})).await.unwrap();
        assert_eq!(repo.get().await.unwrap().settings["owner"], "other");

        repo.delete().await.unwrap();
        assert!(!repo.get().await.unwrap().configured);
    }
}
