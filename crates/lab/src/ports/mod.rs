//! Stream/CDP port allocation.
//!
//! Ports are handed out densely from a configured inclusive range, lowest
//! free first. The in-memory busy set is the fast path; every live
//! allocation is also a `port_reservations` row so the allocator can be
//! rehydrated after a restart. The mutex only guards the CPU-side scan;
//! database writes happen outside it and unique-violation conflicts feed
//! back into the scan.

mod repository;

pub use repository::{PortReservation, PortReservationRepository};

use std::collections::HashSet;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// What a reserved port is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    /// Browser screencast stream.
    Stream,
    /// Chrome DevTools protocol endpoint.
    Cdp,
}

impl std::fmt::Display for PortKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortKind::Stream => write!(f, "stream"),
            PortKind::Cdp => write!(f, "cdp"),
        }
    }
}

impl std::str::FromStr for PortKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(PortKind::Stream),
            "cdp" => Ok(PortKind::Cdp),
            other => Err(format!("unknown port kind: {}", other)),
        }
    }
}

/// Port allocation errors.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("no {kind} ports available in {lo}-{hi}")]
    NoPortsAvailable { kind: PortKind, lo: u16, hi: u16 },

    #[error("port storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Allocator for ports in `[lo, hi]`, at most one live holder per
/// `(port, kind)`.
pub struct PortAllocator {
    lo: u16,
    hi: u16,
    repo: PortReservationRepository,
    busy: Mutex<HashSet<(u16, PortKind)>>,
}

impl PortAllocator {
    pub fn new(lo: u16, hi: u16, repo: PortReservationRepository) -> Self {
        Self {
            lo,
            hi,
            repo,
            busy: Mutex::new(HashSet::new()),
        }
    }

    /// Load existing reservations and pre-mark them busy. Called once at
    /// boot before any allocation.
    pub async fn rehydrate(&self) -> Result<usize, PortError> {
        let reservations = self.repo.list().await?;
        let mut busy = self.busy.lock().await;
        for reservation in &reservations {
            busy.insert((reservation.port, reservation.kind));
        }
        Ok(reservations.len())
    }

    /// Allocate the lowest free port of `kind` for `session_id`.
    pub async fn allocate(&self, session_id: &str, kind: PortKind) -> Result<u16, PortError> {
        loop {
            let candidate = {
                let mut busy = self.busy.lock().await;
                let Some(port) = (self.lo..=self.hi).find(|p| !busy.contains(&(*p, kind))) else {
                    return Err(PortError::NoPortsAvailable {
                        kind,
                        lo: self.lo,
                        hi: self.hi,
                    });
                };
                busy.insert((port, kind));
                port
            };

            // Durable write outside the lock. A unique violation means
            // another process holds the port; keep it marked busy and scan
            // again.
            match self.repo.insert(session_id, candidate, kind).await {
                Ok(()) => {
                    debug!("Allocated {} port {} for session {}", kind, candidate, session_id);
                    return Ok(candidate);
                }
                Err(e) if e.is_conflict() => {
                    debug!("Port {} ({}) already reserved elsewhere, rescanning", candidate, kind);
                    continue;
                }
                Err(e) => {
                    // Roll the in-memory mark back so the port is not leaked.
                    self.busy.lock().await.remove(&(candidate, kind));
                    return Err(PortError::Storage(e.into_inner()));
                }
            }
        }
    }

    /// Release a port. Idempotent.
    pub async fn release(&self, port: u16, kind: PortKind) -> Result<(), PortError> {
        {
            let mut busy = self.busy.lock().await;
            busy.remove(&(port, kind));
        }
        self.repo
            .delete(port, kind)
            .await
            .map_err(|e| PortError::Storage(e.into_inner()))?;
        Ok(())
    }

    /// Mark an externally known port busy without writing a reservation.
    pub async fn reserve(&self, port: u16, kind: PortKind) {
        self.busy.lock().await.insert((port, kind));
    }

    pub async fn is_allocated(&self, port: u16, kind: PortKind) -> bool {
        self.busy.lock().await.contains(&(port, kind))
    }

    pub fn range(&self) -> (u16, u16) {
        (self.lo, self.hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn allocator(lo: u16, hi: u16) -> (PortAllocator, Database) {
        let db = Database::in_memory().await.unwrap();
        // Reservations reference sessions; create a bare one to satisfy the
        // foreign key.
        sqlx::query(
            "INSERT INTO projects (id, name, pool_size, created_at) VALUES ('p1', 'p', 0, '')",
        )
        .execute(db.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO sessions (id, project_id, status, created_at, updated_at) VALUES ('s1', 'p1', 'running', '', '')",
        )
        .execute(db.pool())
        .await
        .unwrap();
        let repo = PortReservationRepository::new(db.pool().clone());
        (PortAllocator::new(lo, hi, repo), db)
    }

    #[tokio::test]
    async fn lowest_free_port_wins() {
        let (alloc, _db) = allocator(9300, 9302).await;
        assert_eq!(alloc.allocate("s1", PortKind::Stream).await.unwrap(), 9300);
        assert_eq!(alloc.allocate("s1", PortKind::Stream).await.unwrap(), 9301);
        alloc.release(9300, PortKind::Stream).await.unwrap();
        assert_eq!(alloc.allocate("s1", PortKind::Stream).await.unwrap(), 9300);
    }

    #[tokio::test]
    async fn exhaustion_reports_no_ports() {
        let (alloc, _db) = allocator(9300, 9301).await;
        alloc.allocate("s1", PortKind::Stream).await.unwrap();
        alloc.allocate("s1", PortKind::Stream).await.unwrap();
        assert!(matches!(
            alloc.allocate("s1", PortKind::Stream).await,
            Err(PortError::NoPortsAvailable { .. })
        ));

        alloc.release(9300, PortKind::Stream).await.unwrap();
        assert_eq!(alloc.allocate("s1", PortKind::Stream).await.unwrap(), 9300);
    }

    #[tokio::test]
    async fn kinds_are_independent() {
        let (alloc, _db) = allocator(9300, 9300).await;
        assert_eq!(alloc.allocate("s1", PortKind::Stream).await.unwrap(), 9300);
        assert_eq!(alloc.allocate("s1", PortKind::Cdp).await.unwrap(), 9300);
        assert!(alloc.is_allocated(9300, PortKind::Stream).await);
        assert!(alloc.is_allocated(9300, PortKind::Cdp).await);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (alloc, _db) = allocator(9300, 9301).await;
        alloc.allocate("s1", PortKind::Stream).await.unwrap();
        alloc.release(9300, PortKind::Stream).await.unwrap();
        alloc.release(9300, PortKind::Stream).await.unwrap();
        assert!(!alloc.is_allocated(9300, PortKind::Stream).await);
    }

    #[tokio::test]
    async fn rehydrate_marks_existing_reservations() {
        let (alloc, db) = allocator(9300, 9301).await;
        alloc.allocate("s1", PortKind::Stream).await.unwrap();

        let repo = PortReservationRepository::new(db.pool().clone());
        let fresh = PortAllocator::new(9300, 9301, repo);
        assert_eq!(fresh.rehydrate().await.unwrap(), 1);
        assert_eq!(fresh.allocate("s1", PortKind::Stream).await.unwrap(), 9301);
    }
}
