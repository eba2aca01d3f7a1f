// Turn-ordered conversations. A session may but need not be bound to a
// project; the newest turns form the agent's working window.

pub mod cache;

pub use cache::SessionCache;

use crate::settings::SettingsBundle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
    pub ts: DateTime<Utc>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
            ts: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: text.into(),
            ts: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Append-only within a session; bounded by the configured turn cap
    /// through summarize-and-evict.
    pub turns: Vec<Turn>,
    pub derived_settings: SettingsBundle,
    /// Rolling summary of turns evicted from the window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(project_id: Option<String>) -> Self {
        Self {
            session_id: format!("sess_{}", uuid::Uuid::new_v4()),
            project_id,
            turns: Vec::new(),
            derived_settings: SettingsBundle::default(),
            summary: None,
            updated_at: Utc::now(),
        }
    }

    pub fn push_turn(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.updated_at = Utc::now();
    }

    /// The last user turn, if any.
    #[must_use]
    pub fn last_user_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == TurnRole::User)
            .map(|t| t.text.as_str())
    }

    /// Newest `n` turns, oldest first.
    #[must_use]
    pub fn recent_turns(&self, n: usize) -> &[Turn] {
        let start = self.turns.len().saturating_sub(n);
        &self.turns[start..]
    }

    /// How many turns exceed the cap.
    #[must_use]
    pub fn over_cap(&self, cap: usize) -> usize {
        self.turns.len().saturating_sub(cap)
    }

    /// Remove the oldest `n` turns, returning them for summarization.
    pub fn evict_oldest(&mut self, n: usize) -> Vec<Turn> {
        let n = n.min(self.turns.len());
        self.turns.drain(..n).collect()
    }

    /// Invariant check: timestamps non-decreasing, and after the first user
    /// turn roles alternate user/assistant.
    #[must_use]
    pub fn turns_well_formed(&self) -> bool {
        for pair in self.turns.windows(2) {
            if pair[1].ts < pair[0].ts {
                return false;
            }
            if pair[0].role == pair[1].role {
                return false;
            }
        }
        self.turns.first().map_or(true, |t| t.role == TurnRole::User)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_window() {
        let mut session = Session::new(None);
        for i in 0..6 {
            session.push_turn(Turn::user(format!("u{i}")));
            session.push_turn(Turn::assistant(format!("a{i}")));
        }
        assert_eq!(session.turns.len(), 12);
        let window = session.recent_turns(4);
        assert_eq!(window.len(), 4);
        assert_eq!(window[0].text, "u4");
        assert_eq!(session.last_user_text(), Some("u5"));
    }

    #[test]
    fn eviction_returns_oldest() {
        let mut session = Session::new(None);
        for i in 0..5 {
            session.push_turn(Turn::user(format!("u{i}")));
            session.push_turn(Turn::assistant(format!("a{i}")));
        }
        assert_eq!(session.over_cap(8), 2);
        let evicted = session.evict_oldest(2);
        assert_eq!(evicted.len(), 2);
        assert_eq!(evicted[0].text, "u0");
        assert_eq!(session.turns.len(), 8);
        assert_eq!(session.turns[0].text, "u1");
    }

    #[test]
    fn well_formed_alternating_turns() {
        let mut session = Session::new(None);
        session.push_turn(Turn::user("hello"));
        session.push_turn(Turn::assistant("hi"));
        session.push_turn(Turn::user("write"));
        assert!(session.turns_well_formed());

        session.push_turn(Turn::user("again"));
        assert!(!session.turns_well_formed());
    }

    #[test]
    fn first_turn_must_be_user() {
        let mut session = Session::new(None);
        session.push_turn(Turn::assistant("unprompted"));
        assert!(!session.turns_well_formed());
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(Session::new(None).session_id, Session::new(None).session_id);
    }
}
