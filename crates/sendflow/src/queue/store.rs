use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::queue::model::{DispatchRow, QueueItem, SendOutcome};

/// Queue-side data store operations used by the processor.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Puts `processing` items last touched before `older_than` back in the queue.
    async fn reclaim_stale_processing(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64>;

    /// Due `pending`/`retry_queued` items, oldest first.
    async fn fetch_due(&self, now: DateTime<Utc>, limit: i64) -> anyhow::Result<Vec<QueueItem>>;

    /// Marks the item `processing`. `false` means another run got there first.
    async fn claim(&self, item_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<bool>;

    /// `None` when the batch row itself does not exist.
    async fn load_dispatch_context(&self, batch_id: Uuid) -> anyhow::Result<Option<DispatchRow>>;

    /// Records that the provider accepted the item. From here on the item
    /// may only reach a terminal outcome, never another send.
    async fn mark_delivered(
        &self,
        item_id: Uuid,
        provider_message_id: Option<&str>,
    ) -> anyhow::Result<()>;

    /// `delivered` items whose terminal write never landed, last touched before `older_than`.
    async fn fetch_stranded_delivered(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> anyhow::Result<Vec<QueueItem>>;

    async fn requeue(
        &self,
        item_id: Uuid,
        attempt_count: i32,
        next_attempt_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn delete(&self, item_id: Uuid) -> anyhow::Result<()>;

    async fn record_outcome(&self, outcome: &SendOutcome) -> anyhow::Result<()>;

    async fn flag_channel_capacity(&self, channel_id: Uuid) -> anyhow::Result<()>;
}
