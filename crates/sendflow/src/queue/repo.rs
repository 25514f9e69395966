// crates/sendflow/src/queue/repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::queue::model::{
    DispatchRow, NewQueueItem, QueueItem, QueueStatus, SendOutcome, SendOutcomeRow,
};
use crate::queue::store::QueueStore;

#[derive(Clone)]
pub struct QueueRepo {
    pool: PgPool,
}

impl QueueRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ----------------------------
    // Enqueue (producer side; used by the CLI and tests)
    // ----------------------------

    pub async fn enqueue(&self, item: NewQueueItem) -> anyhow::Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO message_queue (batch_id, recipient, variables, media_ref, status, next_attempt_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(item.batch_id)
        .bind(&item.recipient)
        .bind(&item.variables)
        .bind(&item.media_ref)
        .bind(QueueStatus::Pending.as_str())
        .bind(item.next_attempt_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get_item(&self, item_id: Uuid) -> anyhow::Result<Option<QueueItem>> {
        let item = sqlx::query_as::<_, QueueItem>("SELECT * FROM message_queue WHERE id = $1")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(item)
    }

    pub async fn get_outcome(
        &self,
        batch_id: Uuid,
        recipient: &str,
    ) -> anyhow::Result<Option<SendOutcomeRow>> {
        let row = sqlx::query_as::<_, SendOutcomeRow>(
            r#"
            SELECT batch_id, recipient, status, provider_message_id,
                   failure_reason, warning, updated_at
            FROM send_outcomes
            WHERE batch_id = $1 AND recipient = $2
            "#,
        )
        .bind(batch_id)
        .bind(recipient)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Rows per queue status, for /metrics and `sendflowctl status`.
    pub async fn depth_by_status(&self) -> anyhow::Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT status, COUNT(*)::bigint
            FROM message_queue
            GROUP BY status
            ORDER BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn rate_limited_channels(&self) -> anyhow::Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM channels WHERE capacity_exhausted ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Daily reset of the capacity flag.
    pub async fn clear_capacity_flags(&self) -> anyhow::Result<u64> {
        let res = sqlx::query(
            "UPDATE channels SET capacity_exhausted = false WHERE capacity_exhausted",
        )
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl QueueStore for QueueRepo {
    async fn reclaim_stale_processing(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        // attempt_count is left alone: the stranded attempt may never have reached the provider
        let res = sqlx::query(
            r#"
            UPDATE message_queue
            SET status = $2,
                next_attempt_at = $3
            WHERE status = $1
              AND (last_attempt_at IS NULL OR last_attempt_at < $3)
            "#,
        )
        .bind(QueueStatus::Processing.as_str())
        .bind(QueueStatus::RetryQueued.as_str())
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn fetch_due(&self, now: DateTime<Utc>, limit: i64) -> anyhow::Result<Vec<QueueItem>> {
        let items = sqlx::query_as::<_, QueueItem>(
            r#"
            SELECT *
            FROM message_queue
            WHERE status IN ($1, $2)
              AND next_attempt_at <= $3
            ORDER BY created_at ASC, id ASC
            LIMIT $4
            "#,
        )
        .bind(QueueStatus::Pending.as_str())
        .bind(QueueStatus::RetryQueued.as_str())
        .bind(now)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    async fn claim(&self, item_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE message_queue
            SET status = $2,
                last_attempt_at = $3
            WHERE id = $1
              AND status IN ($4, $5)
            "#,
        )
        .bind(item_id)
        .bind(QueueStatus::Processing.as_str())
        .bind(now)
        .bind(QueueStatus::Pending.as_str())
        .bind(QueueStatus::RetryQueued.as_str())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn load_dispatch_context(&self, batch_id: Uuid) -> anyhow::Result<Option<DispatchRow>> {
        let row = sqlx::query_as::<_, DispatchRow>(
            r#"
            SELECT
                t.name        AS template_name,
                t.language    AS template_language,
                t.components  AS template_components,
                c.id          AS channel_id,
                c.phone_number_id,
                c.access_token,
                c.segment
            FROM send_batches b
            LEFT JOIN templates t ON t.id = b.template_id
            LEFT JOIN channels c ON c.id = b.channel_id
            WHERE b.id = $1
            "#,
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn mark_delivered(
        &self,
        item_id: Uuid,
        provider_message_id: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE message_queue
            SET status = $2,
                provider_message_id = $3,
                last_attempt_at = now()
            WHERE id = $1
            "#,
        )
        .bind(item_id)
        .bind(QueueStatus::Delivered.as_str())
        .bind(provider_message_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch_stranded_delivered(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> anyhow::Result<Vec<QueueItem>> {
        let items = sqlx::query_as::<_, QueueItem>(
            r#"
            SELECT *
            FROM message_queue
            WHERE status = $1
              AND (last_attempt_at IS NULL OR last_attempt_at < $2)
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#,
        )
        .bind(QueueStatus::Delivered.as_str())
        .bind(older_than)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    async fn requeue(
        &self,
        item_id: Uuid,
        attempt_count: i32,
        next_attempt_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE message_queue
            SET status = $2,
                attempt_count = GREATEST(attempt_count, $3),
                next_attempt_at = $4
            WHERE id = $1
            "#,
        )
        .bind(item_id)
        .bind(QueueStatus::RetryQueued.as_str())
        .bind(attempt_count)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, item_id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM message_queue WHERE id = $1")
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_outcome(&self, outcome: &SendOutcome) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO send_outcomes
                (batch_id, recipient, status, provider_message_id, failure_reason, warning, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, now())
            ON CONFLICT (batch_id, recipient) DO UPDATE
            SET status = EXCLUDED.status,
                provider_message_id = EXCLUDED.provider_message_id,
                failure_reason = EXCLUDED.failure_reason,
                warning = EXCLUDED.warning,
                updated_at = now()
            "#,
        )
        .bind(outcome.batch_id)
        .bind(&outcome.recipient)
        .bind(outcome.status.as_str())
        .bind(&outcome.provider_message_id)
        .bind(&outcome.failure_reason)
        .bind(&outcome.warning)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn flag_channel_capacity(&self, channel_id: Uuid) -> anyhow::Result<()> {
        sqlx::query("UPDATE channels SET capacity_exhausted = true WHERE id = $1")
            .bind(channel_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
