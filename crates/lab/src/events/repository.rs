//! Agent event persistence.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;

/// One event in a session's agent stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub session_id: String,
    pub sequence: i64,
    pub event_data: Value,
    pub created_at: String,
}

/// Repository for `agent_events`.
#[derive(Debug, Clone)]
pub struct AgentEventRepository {
    pool: SqlitePool,
}

impl AgentEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an event; the sequence is assigned densely in the same
    /// statement so concurrent appenders cannot leave gaps.
    pub async fn append(&self, session_id: &str, event_data: &Value) -> Result<AgentEvent> {
        let created_at = Utc::now().to_rfc3339();
        let data = serde_json::to_string(event_data).context("serializing agent event")?;

        let (sequence,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO agent_events (session_id, sequence, event_data, created_at)
            SELECT ?, COALESCE(MAX(sequence), 0) + 1, ?, ?
            FROM agent_events WHERE session_id = ?
            RETURNING sequence
            "#,
        )
        .bind(session_id)
        .bind(&data)
        .bind(&created_at)
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .context("appending agent event")?;

        Ok(AgentEvent {
            session_id: session_id.to_string(),
            sequence,
            event_data: event_data.clone(),
            created_at,
        })
    }

    /// All events for a session in sequence order.
    pub async fn list(&self, session_id: &str) -> Result<Vec<AgentEvent>> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT sequence, event_data, created_at FROM agent_events WHERE session_id = ? ORDER BY sequence",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("listing agent events")?;

        rows.into_iter()
            .map(|(sequence, data, created_at)| {
                Ok(AgentEvent {
                    session_id: session_id.to_string(),
                    sequence,
                    event_data: serde_json::from_str(&data).context("parsing agent event")?,
                    created_at,
                })
            })
            .collect()
    }

    /// Events of one kind for a session, in sequence order.
    pub async fn list_kind(&self, session_id: &str, kind: &str) -> Result<Vec<AgentEvent>> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            r#"
            SELECT sequence, event_data, created_at FROM agent_events
            WHERE session_id = ? AND json_extract(event_data, '$.kind') = ?
            ORDER BY sequence
            "#,
        )
        .bind(session_id)
        .bind(kind)
        .fetch_all(&self.pool)
        .await
        .context("listing agent events by kind")?;

        rows.into_iter()
            .map(|(sequence, data, created_at)| {
                Ok(AgentEvent {
                    session_id: session_id.to_string(),
                    sequence,
                    event_data: serde_json::from_str(&data).context("parsing agent event")?,
                    created_at,
                })
            })
            .collect()
    }

    /// Highest sequence for a session (0 when empty); the ACP channel
    /// checkpoint.
    pub async fn checkpoint(&self, session_id: &str) -> Result<i64> {
        let (max,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(sequence), 0) FROM agent_events WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .context("reading agent event checkpoint")?;

        Ok(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::events;
    use crate::project::{NewProject, ProjectRepository};
    use crate::session::{SessionRepository, SessionStatus};

    async fn setup() -> (AgentEventRepository, String, Database) {
        let db = Database::in_memory().await.unwrap();
        let project = ProjectRepository::new(db.pool().clone())
            .create(&NewProject {
                name: "p".to_string(),
                system_prompt: None,
                pool_size: None,
                containers: vec![],
            })
            .await
            .unwrap();
        let session = SessionRepository::new(db.pool().clone())
            .create(&project.id, None, SessionStatus::Running)
            .await
            .unwrap();
        (AgentEventRepository::new(db.pool().clone()), session.id, db)
    }

    #[tokio::test]
    async fn sequences_are_dense_and_monotonic() {
        let (repo, session_id, _db) = setup().await;
        for i in 0..5 {
            let event = repo
                .append(&session_id, &events::user_message(&format!("m{}", i), "hi"))
                .await
                .unwrap();
            assert_eq!(event.sequence, i + 1);
        }
        assert_eq!(repo.checkpoint(&session_id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn kind_filter_projects_subset() {
        let (repo, session_id, _db) = setup().await;
        repo.append(&session_id, &events::user_message("m1", "hi"))
            .await
            .unwrap();
        repo.append(&session_id, &events::session_complete())
            .await
            .unwrap();

        let messages = repo
            .list_kind(&session_id, events::kind::MESSAGE)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].event_data["id"], "m1");
    }
}
