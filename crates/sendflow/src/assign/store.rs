use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::assign::model::{AgentProfile, Conversation};
use crate::procedures::AssignError;

/// Proof that this run holds the exclusive-run lock. Dropping it without
/// `release` must also give the lock up.
#[async_trait]
pub trait RunLease: Send {
    async fn release(self: Box<Self>) -> anyhow::Result<()>;
}

#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Non-blocking. `None` when another run holds the lock.
    async fn try_acquire_exclusive_run(&self, lock_key: i64)
        -> anyhow::Result<Option<Box<dyn RunLease>>>;

    /// Open, unassigned conversations strictly after `after` in
    /// `(created_at, id)` order.
    async fn fetch_unassigned_chunk(
        &self,
        segment: Option<&str>,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> anyhow::Result<Vec<Conversation>>;

    /// Eligible agents, least recently assigned first (never-assigned first of all).
    async fn eligible_agents(&self, segment: &str) -> anyhow::Result<Vec<AgentProfile>>;

    async fn assign_conversation(
        &self,
        actor_id: &str,
        conversation_id: Uuid,
        agent_id: Uuid,
        reason: &str,
        expected_version: i64,
    ) -> Result<Conversation, AssignError>;
}
