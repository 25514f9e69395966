// crates/sendflow/src/assign/repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::assign::model::{AgentProfile, Conversation};
use crate::assign::store::{AssignmentStore, RunLease};
use crate::procedures::{AssignError, PgProcedures};

#[derive(Clone)]
pub struct AssignmentRepo {
    pool: PgPool,
    procedures: PgProcedures,
}

impl AssignmentRepo {
    pub fn new(pool: PgPool) -> Self {
        let procedures = PgProcedures::new(pool.clone());
        Self { pool, procedures }
    }

    /// Open conversations nobody owns yet, for `sendflowctl status`.
    pub async fn unassigned_count(&self) -> anyhow::Result<i64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)::bigint FROM conversations WHERE status = 'open' AND assigned_agent_id IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }
}

/// Holds the transaction the advisory lock is scoped to. Commit or drop
/// both end the transaction and free the lock.
struct PgRunLease {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl RunLease for PgRunLease {
    async fn release(self: Box<Self>) -> anyhow::Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl AssignmentStore for AssignmentRepo {
    async fn try_acquire_exclusive_run(
        &self,
        lock_key: i64,
    ) -> anyhow::Result<Option<Box<dyn RunLease>>> {
        let mut tx = self.pool.begin().await?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(lock_key)
            .fetch_one(&mut *tx)
            .await?;

        if !acquired {
            tx.rollback().await?;
            return Ok(None);
        }

        Ok(Some(Box::new(PgRunLease { tx })))
    }

    async fn fetch_unassigned_chunk(
        &self,
        segment: Option<&str>,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> anyhow::Result<Vec<Conversation>> {
        let (after_ts, after_id) = match after {
            Some((ts, id)) => (Some(ts), Some(id)),
            None => (None, None),
        };

        let rows = sqlx::query_as::<_, Conversation>(
            r#"
            SELECT id, status, assigned_agent_id, segment, version, created_at
            FROM conversations
            WHERE status = 'open'
              AND assigned_agent_id IS NULL
              AND ($1::text IS NULL OR segment = $1)
              AND ($2::timestamptz IS NULL OR (created_at, id) > ($2, $3::uuid))
            ORDER BY created_at ASC, id ASC
            LIMIT $4
            "#,
        )
        .bind(segment)
        .bind(after_ts)
        .bind(after_id)
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn eligible_agents(&self, segment: &str) -> anyhow::Result<Vec<AgentProfile>> {
        let rows = sqlx::query_as::<_, AgentProfile>(
            r#"
            SELECT id, segment, is_active, present_today, last_chat_assigned_at
            FROM agent_profiles
            WHERE segment = $1
              AND is_active
              AND present_today
            ORDER BY last_chat_assigned_at ASC NULLS FIRST, id ASC
            "#,
        )
        .bind(segment)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn assign_conversation(
        &self,
        actor_id: &str,
        conversation_id: Uuid,
        agent_id: Uuid,
        reason: &str,
        expected_version: i64,
    ) -> Result<Conversation, AssignError> {
        self.procedures
            .assign_conversation(actor_id, conversation_id, agent_id, reason, expected_version)
            .await
    }
}
