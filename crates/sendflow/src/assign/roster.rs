use std::collections::HashMap;

use uuid::Uuid;

#[derive(Debug, Clone)]
enum Roster {
    Agents { ids: Vec<Uuid>, cursor: usize },
    Unavailable(String),
}

/// What the cache can say about a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pick {
    Agent(Uuid),
    /// Segment seen, but no agent can take the conversation.
    NoAgent(String),
    /// Segment not loaded yet in this run.
    Unknown,
}

/// Per-run rotation state: segment -> ordered roster + cursor.
/// Built fresh for every run and never refreshed within one.
#[derive(Debug, Default)]
pub struct RosterCache {
    segments: HashMap<String, Roster>,
}

impl RosterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, segment: &str) -> bool {
        self.segments.contains_key(segment)
    }

    pub fn insert_agents(&mut self, segment: &str, ids: Vec<Uuid>) {
        let roster = if ids.is_empty() {
            Roster::Unavailable("no available agents".to_string())
        } else {
            Roster::Agents { ids, cursor: 0 }
        };
        self.segments.insert(segment.to_string(), roster);
    }

    pub fn insert_unavailable(&mut self, segment: &str, reason: impl Into<String>) {
        self.segments
            .insert(segment.to_string(), Roster::Unavailable(reason.into()));
    }

    /// Agent at the cursor; the cursor then moves on, wrapping around.
    pub fn next_agent(&mut self, segment: &str) -> Pick {
        match self.segments.get_mut(segment) {
            None => Pick::Unknown,
            Some(Roster::Unavailable(reason)) => Pick::NoAgent(reason.clone()),
            Some(Roster::Agents { ids, cursor }) => {
                let id = ids[*cursor];
                *cursor = (*cursor + 1) % ids.len();
                Pick::Agent(id)
            }
        }
    }
}
