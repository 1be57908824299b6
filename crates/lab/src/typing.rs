//! Typing presence backing the `sessionTyping` channel.

use std::collections::HashSet;

use dashmap::DashMap;

/// Who is currently typing, per session.
#[derive(Default)]
pub struct TypingRegistry {
    inner: DashMap<String, HashSet<String>>,
}

impl TypingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a typing state change; returns true when the set changed.
    pub fn set_typing(&self, session_id: &str, user_id: &str, typing: bool) -> bool {
        let mut entry = self.inner.entry(session_id.to_string()).or_default();
        let changed = if typing {
            entry.insert(user_id.to_string())
        } else {
            entry.remove(user_id)
        };
        let empty = entry.is_empty();
        drop(entry);
        if empty {
            self.inner.remove_if(session_id, |_, set| set.is_empty());
        }
        changed
    }

    /// Current typists for a session, sorted for stable snapshots.
    pub fn snapshot(&self, session_id: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .inner
            .get(session_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggling_updates_the_set() {
        let registry = TypingRegistry::new();
        assert!(registry.set_typing("s1", "u1", true));
        assert!(!registry.set_typing("s1", "u1", true));
        assert_eq!(registry.snapshot("s1"), vec!["u1"]);

        assert!(registry.set_typing("s1", "u1", false));
        assert!(registry.snapshot("s1").is_empty());
    }

    #[test]
    fn sessions_are_independent() {
        let registry = TypingRegistry::new();
        registry.set_typing("s1", "u1", true);
        assert!(registry.snapshot("s2").is_empty());
    }
}
