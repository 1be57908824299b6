//! Session database repository.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::models::{
    container_hostname, ContainerStatus, Session, SessionContainer, SessionStatus,
};

/// All session columns for SELECT queries.
const SESSION_COLUMNS: &str =
    "id, project_id, title, status, agent_session_id, error_message, created_at, updated_at";

/// All session container columns for SELECT queries.
const CONTAINER_COLUMNS: &str =
    "id, session_id, container_id, runtime_id, status, hostname, error_message";

/// Repository for sessions and their containers.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new session row.
    pub async fn create(
        &self,
        project_id: &str,
        title: Option<&str>,
        status: SessionStatus,
    ) -> Result<Session> {
        let now = Utc::now().to_rfc3339();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            title: title.map(str::to_string),
            status,
            agent_session_id: None,
            error_message: None,
            created_at: now.clone(),
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO sessions (id, project_id, title, status, agent_session_id, error_message, created_at, updated_at)
            VALUES (?, ?, ?, ?, NULL, NULL, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.project_id)
        .bind(&session.title)
        .bind(session.status.to_string())
        .bind(&session.created_at)
        .bind(&session.updated_at)
        .execute(&self.pool)
        .await
        .context("creating session")?;

        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let query = format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS);
        let session = sqlx::query_as::<_, Session>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session")?;

        Ok(session)
    }

    /// List sessions, newest first. Pooled sessions are internal and
    /// filtered out of client-facing listings.
    pub async fn list_visible(&self) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE status != 'pooled' ORDER BY created_at DESC",
            SESSION_COLUMNS
        );
        let sessions = sqlx::query_as::<_, Session>(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing sessions")?;

        Ok(sessions)
    }

    /// List every session in a given status (crash-recovery sweeps).
    pub async fn list_by_status(&self, status: SessionStatus) -> Result<Vec<Session>> {
        let query = format!("SELECT {} FROM sessions WHERE status = ?", SESSION_COLUMNS);
        let sessions = sqlx::query_as::<_, Session>(&query)
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await
            .context("listing sessions by status")?;

        Ok(sessions)
    }

    pub async fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session status")?;

        Ok(())
    }

    pub async fn update_title(&self, id: &str, title: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE sessions SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session title")?;

        Ok(())
    }

    pub async fn set_agent_session_id(&self, id: &str, agent_session_id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET agent_session_id = ?, updated_at = ? WHERE id = ?")
            .bind(agent_session_id)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("setting agent session id")?;

        Ok(())
    }

    pub async fn mark_error(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET status = 'error', error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking session error")?;

        Ok(())
    }

    /// Delete the session row; the schema cascades containers, ports,
    /// events, and browser state.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting session")?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Pool
    // ------------------------------------------------------------------

    /// Claim the oldest pooled session for a project.
    ///
    /// Single compare-and-set statement: concurrent claimers cannot take
    /// the same session because the subquery re-checks `status = 'pooled'`
    /// under the write lock.
    pub async fn claim_pooled(&self, project_id: &str, title: Option<&str>) -> Result<Option<Session>> {
        let query = format!(
            r#"
            UPDATE sessions
            SET status = 'creating', title = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM sessions
                WHERE project_id = ? AND status = 'pooled'
                ORDER BY created_at ASC
                LIMIT 1
            )
            RETURNING {}
            "#,
            SESSION_COLUMNS
        );

        let session = sqlx::query_as::<_, Session>(&query)
            .bind(title)
            .bind(Utc::now().to_rfc3339())
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await
            .context("claiming pooled session")?;

        Ok(session)
    }

    pub async fn count_pooled(&self, project_id: &str) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sessions WHERE project_id = ? AND status = 'pooled'",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await
        .context("counting pooled sessions")?;

        Ok(count.0)
    }

    /// Pooled sessions plus untitled in-flight warms, so the pool
    /// reconciler does not overshoot while provisioning is running.
    pub async fn count_pool_candidates(&self, project_id: &str) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM sessions
            WHERE project_id = ?
              AND (status = 'pooled' OR (status = 'creating' AND title IS NULL))
            "#,
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await
        .context("counting pool candidates")?;

        Ok(count.0)
    }

    /// Pooled sessions beyond the `keep` oldest (the oldest are claimed
    /// first, so the newest warms are the ones to trim).
    pub async fn list_pooled_excess(&self, project_id: &str, keep: i64) -> Result<Vec<Session>> {
        let query = format!(
            r#"
            SELECT {} FROM sessions
            WHERE project_id = ? AND status = 'pooled'
            ORDER BY created_at ASC
            LIMIT -1 OFFSET ?
            "#,
            SESSION_COLUMNS
        );
        let sessions = sqlx::query_as::<_, Session>(&query)
            .bind(project_id)
            .bind(keep.max(0))
            .fetch_all(&self.pool)
            .await
            .context("listing excess pooled sessions")?;

        Ok(sessions)
    }

    // ------------------------------------------------------------------
    // Containers
    // ------------------------------------------------------------------

    /// Insert a container row for a session, hostname derived from the ids.
    pub async fn create_container(
        &self,
        session_id: &str,
        definition_id: &str,
    ) -> Result<SessionContainer> {
        let container = SessionContainer {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            container_id: definition_id.to_string(),
            runtime_id: None,
            status: ContainerStatus::Starting,
            hostname: container_hostname(session_id, definition_id),
            error_message: None,
        };

        sqlx::query(
            r#"
            INSERT INTO session_containers (id, session_id, container_id, runtime_id, status, hostname, error_message)
            VALUES (?, ?, ?, NULL, ?, ?, NULL)
            "#,
        )
        .bind(&container.id)
        .bind(&container.session_id)
        .bind(&container.container_id)
        .bind(container.status.to_string())
        .bind(&container.hostname)
        .execute(&self.pool)
        .await
        .context("creating session container")?;

        Ok(container)
    }

    pub async fn containers_for_session(&self, session_id: &str) -> Result<Vec<SessionContainer>> {
        let query = format!(
            "SELECT {} FROM session_containers WHERE session_id = ? ORDER BY container_id",
            CONTAINER_COLUMNS
        );
        let containers = sqlx::query_as::<_, SessionContainer>(&query)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .context("listing session containers")?;

        Ok(containers)
    }

    pub async fn get_container(&self, id: &str) -> Result<Option<SessionContainer>> {
        let query = format!(
            "SELECT {} FROM session_containers WHERE id = ?",
            CONTAINER_COLUMNS
        );
        let container = sqlx::query_as::<_, SessionContainer>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session container")?;

        Ok(container)
    }

    pub async fn find_container_by_runtime_id(
        &self,
        runtime_id: &str,
    ) -> Result<Option<SessionContainer>> {
        let query = format!(
            "SELECT {} FROM session_containers WHERE runtime_id = ?",
            CONTAINER_COLUMNS
        );
        let container = sqlx::query_as::<_, SessionContainer>(&query)
            .bind(runtime_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching container by runtime id")?;

        Ok(container)
    }

    pub async fn set_container_runtime_id(&self, id: &str, runtime_id: &str) -> Result<()> {
        sqlx::query("UPDATE session_containers SET runtime_id = ? WHERE id = ?")
            .bind(runtime_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("setting container runtime id")?;

        Ok(())
    }

    pub async fn update_container_status(
        &self,
        id: &str,
        status: ContainerStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE session_containers SET status = ?, error_message = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(error_message)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating container status")?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Volumes
    // ------------------------------------------------------------------

    /// Record a volume, refreshing `last_used_at` when it already exists.
    pub async fn upsert_volume(
        &self,
        name: &str,
        session_id: Option<&str>,
        kind: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO volumes (name, session_id, kind, created_at, last_used_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET last_used_at = excluded.last_used_at
            "#,
        )
        .bind(name)
        .bind(session_id)
        .bind(kind)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("upserting volume")?;

        Ok(())
    }

    /// Orphan a session's volumes (the rows outlive the session so a
    /// sweep can reap the provider objects later).
    pub async fn orphan_volumes_for_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("UPDATE volumes SET session_id = NULL WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("orphaning session volumes")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::project::{NewProject, ProjectRepository};

    async fn setup() -> (SessionRepository, String, Database) {
        let db = Database::in_memory().await.unwrap();
        let projects = ProjectRepository::new(db.pool().clone());
        let project = projects
            .create(&NewProject {
                name: "p".to_string(),
                system_prompt: None,
                pool_size: Some(1),
                containers: vec![],
            })
            .await
            .unwrap();
        (SessionRepository::new(db.pool().clone()), project.id, db)
    }

    #[tokio::test]
    async fn claim_takes_oldest_pooled_once() {
        let (repo, project_id, _db) = setup().await;

        let first = repo
            .create(&project_id, None, SessionStatus::Pooled)
            .await
            .unwrap();
        // Force distinct created_at ordering.
        sqlx::query("UPDATE sessions SET created_at = '2026-01-01T00:00:00Z' WHERE id = ?")
            .bind(&first.id)
            .execute(repo.pool_for_tests())
            .await
            .unwrap();
        repo.create(&project_id, None, SessionStatus::Pooled)
            .await
            .unwrap();

        let claimed = repo
            .claim_pooled(&project_id, Some("fix the bug"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, SessionStatus::Creating);
        assert_eq!(claimed.title.as_deref(), Some("fix the bug"));

        // One pooled session left, then none.
        assert!(repo.claim_pooled(&project_id, None).await.unwrap().is_some());
        assert!(repo.claim_pooled(&project_id, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn container_unique_per_definition() {
        let (repo, project_id, _db) = setup().await;
        let session = repo
            .create(&project_id, None, SessionStatus::Creating)
            .await
            .unwrap();

        repo.create_container(&session.id, "def-1").await.unwrap();
        assert!(repo.create_container(&session.id, "def-1").await.is_err());
    }

    #[tokio::test]
    async fn delete_cascades_containers() {
        let (repo, project_id, _db) = setup().await;
        let session = repo
            .create(&project_id, None, SessionStatus::Creating)
            .await
            .unwrap();
        repo.create_container(&session.id, "def-1").await.unwrap();

        repo.delete(&session.id).await.unwrap();
        assert!(repo
            .containers_for_session(&session.id)
            .await
            .unwrap()
            .is_empty());
    }
}

#[cfg(test)]
impl SessionRepository {
    /// Test-only access to the pool.
    pub(crate) fn pool_for_tests(&self) -> &SqlitePool {
        &self.pool
    }
}
