mod common;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use serial_test::serial;
use sqlx::PgPool;

use common::{enqueue, insert_batch, insert_channel, insert_template, ready_batch, setup_db};
use sendflow::procedures::PgProcedures;
use sendflow::queue::model::ChannelCredential;
use sendflow::queue::{
    DeliveryClient, DeliveryResult, ProcessorConfig, QueueProcessor, QueueRepo, QueueStatus,
};

/// Plays back scripted results, then accepts everything.
#[derive(Default)]
struct ScriptedDelivery {
    script: Mutex<VecDeque<DeliveryResult>>,
    calls: Mutex<Vec<(String, String, Value)>>,
}

impl ScriptedDelivery {
    fn with(results: Vec<DeliveryResult>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(results.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl DeliveryClient for ScriptedDelivery {
    async fn send(
        &self,
        _credential: &ChannelCredential,
        recipient: &str,
        template_payload: &Value,
        idempotency_token: &str,
    ) -> DeliveryResult {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((
                recipient.to_string(),
                idempotency_token.to_string(),
                template_payload.clone(),
            ));
            calls.len()
        };
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| DeliveryResult::accepted(Some(format!("wamid.{n}"))))
    }
}

fn processor(pool: &PgPool, delivery: Arc<ScriptedDelivery>) -> QueueProcessor {
    QueueProcessor::new(
        Arc::new(QueueRepo::new(pool.clone())),
        Arc::new(PgProcedures::new(pool.clone())),
        delivery,
        ProcessorConfig::default(),
    )
}

#[tokio::test]
#[serial]
async fn sent_item_is_recorded_and_removed() {
    let Some(pool) = setup_db().await else { return };
    let (batch_id, channel_id) = ready_batch(&pool, "sales").await;
    let item_id = enqueue(&pool, batch_id, "+15550001", 0).await;

    let delivery = ScriptedDelivery::with(vec![DeliveryResult::accepted(Some("wamid.A".into()))]);
    let summary = processor(&pool, delivery.clone()).run_once().await.unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.sent, 1);

    let repo = QueueRepo::new(pool.clone());
    assert!(repo.get_item(item_id).await.unwrap().is_none());

    let outcome = repo.get_outcome(batch_id, "+15550001").await.unwrap().unwrap();
    assert_eq!(outcome.status, "sent");
    assert_eq!(outcome.provider_message_id.as_deref(), Some("wamid.A"));
    assert!(outcome.failure_reason.is_none());
    assert!(outcome.warning.is_none());

    // conversation resolved on the batch channel, message logged with the provider id
    let (segment, conv_channel): (String, Option<uuid::Uuid>) = sqlx::query_as(
        "SELECT segment, channel_id FROM conversations WHERE recipient = '+15550001'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(segment, "sales");
    assert_eq!(conv_channel, Some(channel_id));

    let provider_id: Option<String> =
        sqlx::query_scalar("SELECT provider_message_id FROM messages")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(provider_id.as_deref(), Some("wamid.A"));

    let calls = delivery.calls.lock().unwrap();
    assert_eq!(calls[0].1, format!("{item_id}:0"));
    assert!(!calls[0].2.to_string().contains("example"));
}

#[tokio::test]
#[serial]
async fn transient_failure_is_requeued_with_backoff() {
    let Some(pool) = setup_db().await else { return };
    let (batch_id, _) = ready_batch(&pool, "sales").await;
    let item_id = enqueue(&pool, batch_id, "+15550002", 0).await;

    let delivery = ScriptedDelivery::with(vec![DeliveryResult::rejected("131000", "something went wrong")]);
    let before = Utc::now();
    let summary = processor(&pool, delivery).run_once().await.unwrap();

    assert_eq!(summary.requeued, 1);

    let item = QueueRepo::new(pool.clone()).get_item(item_id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::RetryQueued.as_str());
    assert_eq!(item.attempt_count, 1);
    let delay = (item.next_attempt_at - before).num_seconds();
    assert!((58..=62).contains(&delay), "delay was {delay}s");

    let outcome = QueueRepo::new(pool.clone())
        .get_outcome(batch_id, "+15550002")
        .await
        .unwrap();
    assert!(outcome.is_none());
}

#[tokio::test]
#[serial]
async fn rate_limit_flags_channel_and_requeues() {
    let Some(pool) = setup_db().await else { return };
    let (batch_id, channel_id) = ready_batch(&pool, "sales").await;
    let item_id = enqueue(&pool, batch_id, "+15550003", 0).await;

    let delivery = ScriptedDelivery::with(vec![DeliveryResult::rejected("131056", "pair rate limit hit")]);
    processor(&pool, delivery).run_once().await.unwrap();

    let repo = QueueRepo::new(pool.clone());
    assert_eq!(repo.rate_limited_channels().await.unwrap(), vec![channel_id]);

    let item = repo.get_item(item_id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::RetryQueued.as_str());
    assert_eq!(item.attempt_count, 1);

    assert_eq!(repo.clear_capacity_flags().await.unwrap(), 1);
    assert!(repo.rate_limited_channels().await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn exhausted_item_fails_permanently() {
    let Some(pool) = setup_db().await else { return };
    let (batch_id, _) = ready_batch(&pool, "sales").await;
    let item_id = enqueue(&pool, batch_id, "+15550004", 3).await;

    let delivery = ScriptedDelivery::with(vec![DeliveryResult::rejected("TIMEOUT", "slow")]);
    let summary = processor(&pool, delivery.clone()).run_once().await.unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(delivery.calls.lock().unwrap()[0].1, format!("{item_id}:3"));

    let repo = QueueRepo::new(pool.clone());
    assert!(repo.get_item(item_id).await.unwrap().is_none());
    let outcome = repo.get_outcome(batch_id, "+15550004").await.unwrap().unwrap();
    assert_eq!(outcome.status, "failed");
    assert!(outcome
        .failure_reason
        .unwrap()
        .starts_with("RETRIES_EXHAUSTED"));
}

#[tokio::test]
#[serial]
async fn rejected_template_fails_without_retry() {
    let Some(pool) = setup_db().await else { return };
    let (batch_id, _) = ready_batch(&pool, "sales").await;
    enqueue(&pool, batch_id, "+15550005", 0).await;

    let delivery = ScriptedDelivery::with(vec![DeliveryResult::rejected("132001", "template does not exist")]);
    let summary = processor(&pool, delivery).run_once().await.unwrap();
    assert_eq!(summary.failed, 1);

    let outcome = QueueRepo::new(pool.clone())
        .get_outcome(batch_id, "+15550005")
        .await
        .unwrap()
        .unwrap();
    let reason = outcome.failure_reason.unwrap();
    assert!(reason.starts_with("TEMPLATE_REJECTED"));
    assert!(reason.contains("132001"));
}

#[tokio::test]
#[serial]
async fn missing_credentials_fail_without_calling_provider() {
    let Some(pool) = setup_db().await else { return };
    let template_id = insert_template(&pool, "greeting", common::body_template()).await;
    let channel_id = insert_channel(&pool, Some("pn-2"), None, "sales").await;
    let batch_id = insert_batch(&pool, template_id, channel_id).await;
    enqueue(&pool, batch_id, "+15550006", 0).await;

    let delivery = ScriptedDelivery::with(Vec::new());
    let summary = processor(&pool, delivery.clone()).run_once().await.unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(delivery.call_count(), 0);

    let outcome = QueueRepo::new(pool.clone())
        .get_outcome(batch_id, "+15550006")
        .await
        .unwrap()
        .unwrap();
    let reason = outcome.failure_reason.unwrap();
    assert!(reason.starts_with("MISSING_CONFIGURATION"));
    assert!(reason.contains("access_token"));
}

#[tokio::test]
#[serial]
async fn stranded_processing_item_is_reclaimed_and_sent() {
    let Some(pool) = setup_db().await else { return };
    let (batch_id, _) = ready_batch(&pool, "sales").await;
    let item_id = enqueue(&pool, batch_id, "+15550007", 1).await;
    sqlx::query(
        "UPDATE message_queue SET status = 'processing', last_attempt_at = now() - interval '1 hour' WHERE id = $1",
    )
    .bind(item_id)
    .execute(&pool)
    .await
    .unwrap();

    let delivery = ScriptedDelivery::with(Vec::new());
    let summary = processor(&pool, delivery.clone()).run_once().await.unwrap();

    assert_eq!(summary.reclaimed, 1);
    assert_eq!(summary.sent, 1);
    // same attempt number as the stranded attempt
    assert_eq!(delivery.calls.lock().unwrap()[0].1, format!("{item_id}:1"));
}

#[tokio::test]
#[serial]
async fn fresh_processing_item_is_left_alone() {
    let Some(pool) = setup_db().await else { return };
    let (batch_id, _) = ready_batch(&pool, "sales").await;
    let item_id = enqueue(&pool, batch_id, "+15550008", 0).await;
    sqlx::query("UPDATE message_queue SET status = 'processing', last_attempt_at = now() WHERE id = $1")
        .bind(item_id)
        .execute(&pool)
        .await
        .unwrap();

    let delivery = ScriptedDelivery::with(Vec::new());
    let summary = processor(&pool, delivery.clone()).run_once().await.unwrap();

    assert_eq!(summary.reclaimed, 0);
    assert_eq!(summary.processed, 0);
    assert_eq!(delivery.call_count(), 0);
}

#[tokio::test]
#[serial]
async fn concurrent_runs_send_each_item_once() {
    let Some(pool) = setup_db().await else { return };
    let (batch_id, _) = ready_batch(&pool, "sales").await;
    for i in 0..10 {
        enqueue(&pool, batch_id, &format!("+1555100{i}"), 0).await;
    }

    let delivery = ScriptedDelivery::with(Vec::new());
    let a = processor(&pool, delivery.clone());
    let b = processor(&pool, delivery.clone());

    let (ra, rb) = tokio::join!(a.run_once(), b.run_once());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.sent + rb.sent, 10);
    assert_eq!(delivery.call_count(), 10);

    let sent: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM send_outcomes WHERE status = 'sent'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(sent, 10);
}

#[tokio::test]
#[serial]
async fn not_yet_due_items_are_not_fetched() {
    let Some(pool) = setup_db().await else { return };
    let (batch_id, _) = ready_batch(&pool, "sales").await;
    let item_id = enqueue(&pool, batch_id, "+15550009", 1).await;
    sqlx::query("UPDATE message_queue SET status = 'retry_queued', next_attempt_at = now() + interval '5 minutes' WHERE id = $1")
        .bind(item_id)
        .execute(&pool)
        .await
        .unwrap();

    let delivery = ScriptedDelivery::with(Vec::new());
    let summary = processor(&pool, delivery.clone()).run_once().await.unwrap();

    assert_eq!(summary.processed, 0);
    assert_eq!(delivery.call_count(), 0);
}

#[tokio::test]
#[serial]
async fn stranded_delivered_item_is_closed_without_resending() {
    let Some(pool) = setup_db().await else { return };
    let (batch_id, _) = ready_batch(&pool, "sales").await;
    let item_id = enqueue(&pool, batch_id, "+15550010", 0).await;
    sqlx::query(
        "UPDATE message_queue SET status = 'delivered', provider_message_id = 'wamid.X', last_attempt_at = now() - interval '1 hour' WHERE id = $1",
    )
    .bind(item_id)
    .execute(&pool)
    .await
    .unwrap();

    let delivery = ScriptedDelivery::with(Vec::new());
    let summary = processor(&pool, delivery.clone()).run_once().await.unwrap();

    assert_eq!(summary.recovered, 1);
    assert_eq!(summary.reclaimed, 0);
    assert_eq!(summary.processed, 0);
    assert_eq!(delivery.call_count(), 0);

    let repo = QueueRepo::new(pool.clone());
    assert!(repo.get_item(item_id).await.unwrap().is_none());
    let outcome = repo.get_outcome(batch_id, "+15550010").await.unwrap().unwrap();
    assert_eq!(outcome.status, "sent");
    assert_eq!(outcome.provider_message_id.as_deref(), Some("wamid.X"));
    assert!(outcome.warning.is_some());
}

#[tokio::test]
#[serial]
async fn fresh_delivered_item_is_not_reclaimed() {
    let Some(pool) = setup_db().await else { return };
    let (batch_id, _) = ready_batch(&pool, "sales").await;
    let item_id = enqueue(&pool, batch_id, "+15550011", 0).await;
    sqlx::query(
        "UPDATE message_queue SET status = 'delivered', provider_message_id = 'wamid.Y', last_attempt_at = now() WHERE id = $1",
    )
    .bind(item_id)
    .execute(&pool)
    .await
    .unwrap();

    let delivery = ScriptedDelivery::with(Vec::new());
    let summary = processor(&pool, delivery.clone()).run_once().await.unwrap();

    assert_eq!(summary.recovered, 0);
    assert_eq!(summary.reclaimed, 0);
    assert_eq!(delivery.call_count(), 0);
    let item = QueueRepo::new(pool.clone()).get_item(item_id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Delivered.as_str());
}
