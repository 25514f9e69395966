use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// The conversation columns the scheduler reads.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Conversation {
    pub id: Uuid,
    pub status: String,
    pub assigned_agent_id: Option<Uuid>,
    pub segment: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct AgentProfile {
    pub id: Uuid,
    pub segment: String,
    pub is_active: bool,
    pub present_today: bool,
    pub last_chat_assigned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Another run holds the lock; nothing was attempted.
    RunningElsewhere,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignFailure {
    pub conversation_id: Uuid,
    pub segment: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignSummary {
    pub status: RunStatus,
    pub assigned: usize,
    /// Exact count, even when `failures` was cut short.
    pub failed: usize,
    pub failures: Vec<AssignFailure>,
    pub failures_truncated: bool,
}

impl AssignSummary {
    pub fn running_elsewhere() -> Self {
        Self {
            status: RunStatus::RunningElsewhere,
            assigned: 0,
            failed: 0,
            failures: Vec::new(),
            failures_truncated: false,
        }
    }

    pub(crate) fn completed() -> Self {
        Self {
            status: RunStatus::Completed,
            ..Self::running_elsewhere()
        }
    }

    pub(crate) fn record_failure(&mut self, failure: AssignFailure, max_details: usize) {
        self.failed += 1;
        if self.failures.len() < max_details {
            self.failures.push(failure);
        } else {
            self.failures_truncated = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_details_are_capped_but_count_is_exact() {
        let mut s = AssignSummary::completed();
        for _ in 0..5 {
            s.record_failure(
                AssignFailure {
                    conversation_id: Uuid::new_v4(),
                    segment: "a".into(),
                    reason: "no available agents".into(),
                },
                3,
            );
        }
        assert_eq!(s.failed, 5);
        assert_eq!(s.failures.len(), 3);
        assert!(s.failures_truncated);
    }

    #[test]
    fn running_elsewhere_serializes_as_snake_case() {
        let json = serde_json::to_value(AssignSummary::running_elsewhere()).unwrap();
        assert_eq!(json["status"], "running_elsewhere");
        assert_eq!(json["assigned"], 0);
    }
}
