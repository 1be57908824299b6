//! Browser session state persistence.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::BrowserSessionState;

const STATE_COLUMNS: &str =
    "session_id, desired, actual, stream_port, last_url, retry_count, error_message, last_heartbeat_at";

/// Repository for `browser_sessions`.
#[derive(Debug, Clone)]
pub struct BrowserStateRepository {
    pool: SqlitePool,
}

impl BrowserStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<BrowserSessionState>> {
        let query = format!(
            "SELECT {} FROM browser_sessions WHERE session_id = ?",
            STATE_COLUMNS
        );
        let state = sqlx::query_as::<_, BrowserSessionState>(&query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching browser state")?;

        Ok(state)
    }

    /// Write the full state row, inserting it if absent.
    pub async fn save(&self, state: &BrowserSessionState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO browser_sessions
                (session_id, desired, actual, stream_port, last_url, retry_count, error_message, last_heartbeat_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                desired = excluded.desired,
                actual = excluded.actual,
                stream_port = excluded.stream_port,
                last_url = excluded.last_url,
                retry_count = excluded.retry_count,
                error_message = excluded.error_message,
                last_heartbeat_at = excluded.last_heartbeat_at
            "#,
        )
        .bind(&state.session_id)
        .bind(state.desired.to_string())
        .bind(state.actual.to_string())
        .bind(state.stream_port)
        .bind(&state.last_url)
        .bind(state.retry_count)
        .bind(&state.error_message)
        .bind(&state.last_heartbeat_at)
        .execute(&self.pool)
        .await
        .context("saving browser state")?;

        Ok(())
    }

    /// Every persisted browser state (reconcile sweep input).
    pub async fn list(&self) -> Result<Vec<BrowserSessionState>> {
        let query = format!("SELECT {} FROM browser_sessions", STATE_COLUMNS);
        let states = sqlx::query_as::<_, BrowserSessionState>(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing browser states")?;

        Ok(states)
    }

    pub async fn delete(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM browser_sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("deleting browser state")?;

        Ok(())
    }
}
