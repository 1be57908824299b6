//! Per-session log buffers backing the `sessionLogs` channel.
//!
//! Sources are coarse (one per container hostname plus "orchestrator");
//! each keeps a bounded ring of recent lines. Full log streaming is the
//! provider's business; these buffers exist so a client joining late still
//! sees recent lifecycle output.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Lines kept per (session, source).
const RING_CAPACITY: usize = 500;

/// One retained log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub source: String,
    pub line: String,
    pub timestamp: String,
}

/// Snapshot payload for `sessionLogs/{uuid}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsSnapshot {
    pub sources: Vec<String>,
    pub recent_logs: HashMap<String, Vec<LogLine>>,
}

/// In-memory log rings, keyed by session id.
#[derive(Default)]
pub struct LogRegistry {
    inner: DashMap<String, HashMap<String, VecDeque<LogLine>>>,
}

impl LogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line; returns the stored entry for delta publication.
    pub fn append(&self, session_id: &str, source: &str, line: impl Into<String>) -> LogLine {
        let entry = LogLine {
            source: source.to_string(),
            line: line.into(),
            timestamp: Utc::now().to_rfc3339(),
        };

        let mut session = self.inner.entry(session_id.to_string()).or_default();
        let ring = session.entry(source.to_string()).or_default();
        if ring.len() == RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(entry.clone());

        entry
    }

    /// Snapshot for one session.
    pub fn snapshot(&self, session_id: &str) -> LogsSnapshot {
        let Some(session) = self.inner.get(session_id) else {
            return LogsSnapshot {
                sources: Vec::new(),
                recent_logs: HashMap::new(),
            };
        };

        let mut sources: Vec<String> = session.keys().cloned().collect();
        sources.sort();
        let recent_logs = session
            .iter()
            .map(|(source, ring)| (source.clone(), ring.iter().cloned().collect()))
            .collect();

        LogsSnapshot {
            sources,
            recent_logs,
        }
    }

    /// Drop a session's buffers (teardown).
    pub fn remove_session(&self, session_id: &str) {
        self.inner.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded() {
        let registry = LogRegistry::new();
        for i in 0..(RING_CAPACITY + 20) {
            registry.append("s1", "web", format!("line {}", i));
        }
        let snapshot = registry.snapshot("s1");
        let lines = &snapshot.recent_logs["web"];
        assert_eq!(lines.len(), RING_CAPACITY);
        assert_eq!(lines[0].line, "line 20");
    }

    #[test]
    fn sources_are_sorted() {
        let registry = LogRegistry::new();
        registry.append("s1", "web", "a");
        registry.append("s1", "api", "b");
        assert_eq!(registry.snapshot("s1").sources, vec!["api", "web"]);
    }

    #[test]
    fn unknown_session_snapshot_is_empty() {
        let registry = LogRegistry::new();
        let snapshot = registry.snapshot("nope");
        assert!(snapshot.sources.is_empty());
        assert!(snapshot.recent_logs.is_empty());
    }
}
