//! Port reservation persistence.

use anyhow::Context;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::PortKind;

/// A durable `(port, kind)` reservation owned by a session.
#[derive(Debug, Clone)]
pub struct PortReservation {
    pub id: String,
    pub session_id: String,
    pub port: u16,
    pub kind: PortKind,
    pub reserved_at: String,
    pub expires_at: Option<String>,
}

/// Insert failure, distinguishing unique-constraint conflicts so the
/// allocator can rescan instead of failing.
#[derive(Debug)]
pub struct InsertError {
    conflict: bool,
    inner: anyhow::Error,
}

impl InsertError {
    pub fn is_conflict(&self) -> bool {
        self.conflict
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }
}

/// Repository for `port_reservations`.
#[derive(Debug, Clone)]
pub struct PortReservationRepository {
    pool: SqlitePool,
}

impl PortReservationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a reservation. Unique `(port, kind)` is enforced by the
    /// schema.
    pub async fn insert(
        &self,
        session_id: &str,
        port: u16,
        kind: PortKind,
    ) -> Result<(), InsertError> {
        let result = sqlx::query(
            r#"
            INSERT INTO port_reservations (id, session_id, port, kind, reserved_at, expires_at)
            VALUES (?, ?, ?, ?, ?, NULL)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(session_id)
        .bind(port as i64)
        .bind(kind.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let conflict = e
                    .as_database_error()
                    .is_some_and(|d| d.is_unique_violation());
                Err(InsertError {
                    conflict,
                    inner: anyhow::Error::new(e).context("inserting port reservation"),
                })
            }
        }
    }

    /// Delete a reservation. Idempotent.
    pub async fn delete(&self, port: u16, kind: PortKind) -> Result<(), InsertError> {
        sqlx::query("DELETE FROM port_reservations WHERE port = ? AND kind = ?")
            .bind(port as i64)
            .bind(kind.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| InsertError {
                conflict: false,
                inner: anyhow::Error::new(e).context("deleting port reservation"),
            })?;
        Ok(())
    }

    /// List all reservations (boot rehydration).
    pub async fn list(&self) -> anyhow::Result<Vec<PortReservation>> {
        let rows: Vec<(String, String, i64, String, String, Option<String>)> = sqlx::query_as(
            "SELECT id, session_id, port, kind, reserved_at, expires_at FROM port_reservations",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing port reservations")?;

        let mut reservations = Vec::with_capacity(rows.len());
        for (id, session_id, port, kind, reserved_at, expires_at) in rows {
            let kind: PortKind = kind
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("parsing reservation kind")?;
            reservations.push(PortReservation {
                id,
                session_id,
                port: port as u16,
                kind,
                reserved_at,
                expires_at,
            });
        }
        Ok(reservations)
    }

    /// Find the stream reservation for a session, if any.
    pub async fn find_for_session(
        &self,
        session_id: &str,
        kind: PortKind,
    ) -> anyhow::Result<Option<u16>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT port FROM port_reservations WHERE session_id = ? AND kind = ? LIMIT 1",
        )
        .bind(session_id)
        .bind(kind.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("finding session port reservation")?;

        Ok(row.map(|(port,)| port as u16))
    }
}
