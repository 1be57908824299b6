//! Orchestration request persistence.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::models::{OrchestrationRequest, OrchestrationStatus};

const REQUEST_COLUMNS: &str = "id, channel_id, content, status, resolved_project_id, resolved_session_id, model_id, error_message, created_at, updated_at";

/// Repository for `orchestration_requests`.
#[derive(Debug, Clone)]
pub struct OrchestrationRepository {
    pool: SqlitePool,
}

impl OrchestrationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        content: &str,
        channel_id: Option<&str>,
        model_id: Option<&str>,
    ) -> Result<OrchestrationRequest> {
        let now = Utc::now().to_rfc3339();
        let request = OrchestrationRequest {
            id: Uuid::new_v4().to_string(),
            channel_id: channel_id.map(str::to_string),
            content: content.to_string(),
            status: OrchestrationStatus::Pending,
            resolved_project_id: None,
            resolved_session_id: None,
            model_id: model_id.map(str::to_string),
            error_message: None,
            created_at: now.clone(),
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO orchestration_requests
                (id, channel_id, content, status, resolved_project_id, resolved_session_id, model_id, error_message, created_at, updated_at)
            VALUES (?, ?, ?, ?, NULL, NULL, ?, NULL, ?, ?)
            "#,
        )
        .bind(&request.id)
        .bind(&request.channel_id)
        .bind(&request.content)
        .bind(request.status.to_string())
        .bind(&request.model_id)
        .bind(&request.created_at)
        .bind(&request.updated_at)
        .execute(&self.pool)
        .await
        .context("creating orchestration request")?;

        Ok(request)
    }

    pub async fn get(&self, id: &str) -> Result<Option<OrchestrationRequest>> {
        let query = format!(
            "SELECT {} FROM orchestration_requests WHERE id = ?",
            REQUEST_COLUMNS
        );
        let request = sqlx::query_as::<_, OrchestrationRequest>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching orchestration request")?;

        Ok(request)
    }

    pub async fn update_status(&self, id: &str, status: OrchestrationStatus) -> Result<()> {
        sqlx::query("UPDATE orchestration_requests SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating orchestration status")?;

        Ok(())
    }

    pub async fn set_resolved_project(&self, id: &str, project_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE orchestration_requests SET resolved_project_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(project_id)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("setting resolved project")?;

        Ok(())
    }

    pub async fn set_resolved_session(&self, id: &str, session_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE orchestration_requests SET resolved_session_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(session_id)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("setting resolved session")?;

        Ok(())
    }

    pub async fn mark_error(&self, id: &str, message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE orchestration_requests SET status = 'error', error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking orchestration error")?;

        Ok(())
    }
}
