//! Ordered conversation log fed by the session's receive loop.
//!
//! Append-only with a single writer; the UI reads snapshots. Fragments are
//! appended in arrival order with no deduplication.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "you"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationEntry {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct TranscriptLog {
    entries: Vec<ConversationEntry>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, role: Role, text: impl Into<String>) {
        self.entries.push(ConversationEntry {
            role,
            text: text.into(),
        });
    }

    /// Copy of the current log for the UI.
    pub fn snapshot(&self) -> Vec<ConversationEntry> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reset for a new analysis session.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_keep_arrival_order_and_roles() {
        let mut log = TranscriptLog::new();
        log.append(Role::User, "does this look serious");
        log.append(Role::Assistant, "the scan shows");
        log.append(Role::User, "should I worry");

        let entries = log.snapshot();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].role, Role::User);
        assert_eq!(entries[1].role, Role::Assistant);
        assert_eq!(entries[2].role, Role::User);
        assert_eq!(entries[2].text, "should I worry");
    }

    #[test]
    fn identical_fragments_are_not_deduplicated() {
        let mut log = TranscriptLog::new();
        log.append(Role::Assistant, "mm-hmm");
        log.append(Role::Assistant, "mm-hmm");
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn snapshot_is_detached_from_later_appends() {
        let mut log = TranscriptLog::new();
        log.append(Role::User, "hello");
        let snapshot = log.snapshot();
        log.append(Role::Assistant, "hi");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn clear_starts_a_fresh_session() {
        let mut log = TranscriptLog::new();
        log.append(Role::User, "old conversation");
        log.clear();
        assert!(log.is_empty());
    }
}
