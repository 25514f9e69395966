use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::procedures::{MessagingProcedures, NewMessageRecord};
use crate::queue::backoff::BackoffSchedule;
use crate::queue::delivery::{idempotency_token, DeliveryClient, DeliveryResult};
use crate::queue::error_codes::{ErrorClass, ErrorClassifier, FailureCode, TIMEOUT};
use crate::queue::model::{
    truncate_reason, DispatchContext, OutcomeStatus, QueueItem, SendOutcome, MAX_REASON_CHARS,
};
use crate::queue::payload::build_template_payload;
use crate::queue::store::QueueStore;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub batch_size: i64,
    pub max_retries: i32,
    pub backoff: BackoffSchedule,
    pub classifier: ErrorClassifier,
    pub delivery_timeout: Duration,
    pub stale_processing_after: chrono::Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_retries: 3,
            backoff: BackoffSchedule::default(),
            classifier: ErrorClassifier::default(),
            delivery_timeout: Duration::from_secs(25),
            stale_processing_after: chrono::Duration::minutes(10),
        }
    }
}

/// Counts for one `run_once`. `processed` covers every claimed item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
    pub requeued: usize,
    pub skipped: usize,
    pub errored: usize,
    pub reclaimed: u64,
    /// Delivered items from an interrupted run, closed out as `sent`.
    pub recovered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Sent,
    Failed,
    Requeued,
    Skipped,
}

#[derive(Clone)]
pub struct QueueProcessor {
    store: Arc<dyn QueueStore>,
    procedures: Arc<dyn MessagingProcedures>,
    delivery: Arc<dyn DeliveryClient>,
    cfg: ProcessorConfig,
}

impl QueueProcessor {
    pub fn new(
        store: Arc<dyn QueueStore>,
        procedures: Arc<dyn MessagingProcedures>,
        delivery: Arc<dyn DeliveryClient>,
        cfg: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            procedures,
            delivery,
            cfg,
        }
    }

    /// Drains one batch of due items. Only a failed batch fetch is an `Err`;
    /// per-item problems are counted and the run moves on.
    pub async fn run_once(&self) -> anyhow::Result<RunSummary> {
        let mut summary = RunSummary::default();
        let cutoff = Utc::now() - self.cfg.stale_processing_after;

        self.recover_delivered(cutoff, &mut summary).await;

        match self.store.reclaim_stale_processing(cutoff).await {
            Ok(n) => {
                if n > 0 {
                    warn!(reclaimed = n, "returned stranded processing items to the queue");
                }
                summary.reclaimed = n;
            }
            Err(e) => warn!(error = %e, "stale processing reclaim failed"),
        }

        let items = self.store.fetch_due(Utc::now(), self.cfg.batch_size).await?;
        debug!(due = items.len(), "fetched due queue items");

        for item in &items {
            match self.process_item(item).await {
                Ok(ItemOutcome::Sent) => summary.sent += 1,
                Ok(ItemOutcome::Failed) => summary.failed += 1,
                Ok(ItemOutcome::Requeued) => summary.requeued += 1,
                Ok(ItemOutcome::Skipped) => {
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    summary.errored += 1;
                    warn!(item_id = %item.id, error = %e, "queue item left unfinished");
                }
            }
            summary.processed += 1;
        }

        if summary.processed > 0 || summary.skipped > 0 || summary.recovered > 0 {
            info!(
                processed = summary.processed,
                sent = summary.sent,
                failed = summary.failed,
                requeued = summary.requeued,
                skipped = summary.skipped,
                errored = summary.errored,
                recovered = summary.recovered,
                "queue run finished"
            );
        }

        Ok(summary)
    }

    /// Items the provider already accepted but whose outcome was never
    /// written. They are finished as `sent` and never go back to the queue.
    async fn recover_delivered(&self, cutoff: chrono::DateTime<Utc>, summary: &mut RunSummary) {
        let stranded = match self
            .store
            .fetch_stranded_delivered(cutoff, self.cfg.batch_size)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "stranded delivered lookup failed");
                return;
            }
        };

        for item in &stranded {
            let outcome = SendOutcome {
                batch_id: item.batch_id,
                recipient: item.recipient.clone(),
                status: OutcomeStatus::Sent,
                provider_message_id: item.provider_message_id.clone(),
                failure_reason: None,
                warning: Some(
                    "run interrupted after provider accepted the message; conversation logging unconfirmed"
                        .to_string(),
                ),
            };
            let res = match self.store.record_outcome(&outcome).await {
                Ok(()) => self.store.delete(item.id).await,
                Err(e) => Err(e),
            };
            match res {
                Ok(()) => {
                    summary.recovered += 1;
                    warn!(item_id = %item.id, "closed out delivered item from an interrupted run");
                }
                Err(e) => {
                    summary.errored += 1;
                    warn!(item_id = %item.id, error = %e, "delivered item still unfinished");
                }
            }
        }
    }

    async fn process_item(&self, item: &QueueItem) -> anyhow::Result<ItemOutcome> {
        // 1) claim
        if !self.store.claim(item.id, Utc::now()).await? {
            debug!(item_id = %item.id, "item claimed elsewhere, skipping");
            return Ok(ItemOutcome::Skipped);
        }

        // 2) joined context
        let ctx = match self.store.load_dispatch_context(item.batch_id).await? {
            Some(row) => match row.into_context() {
                Ok(ctx) => ctx,
                Err(missing) => {
                    let detail = format!("missing configuration: {}", missing.join(", "));
                    return self
                        .finish_failed(item, FailureCode::MissingConfiguration, &detail, None)
                        .await;
                }
            },
            None => {
                let detail = format!("missing configuration: send batch {} not found", item.batch_id);
                return self
                    .finish_failed(item, FailureCode::MissingConfiguration, &detail, None)
                    .await;
            }
        };

        // 3) payload
        let payload = match build_template_payload(
            &ctx.template,
            &item.variables,
            item.media_ref.as_deref(),
        ) {
            Ok(p) => p,
            Err(e) => {
                return self
                    .finish_failed(item, FailureCode::InvalidPayload, &e.to_string(), None)
                    .await;
            }
        };

        // 4) deliver
        let token = idempotency_token(item.id, item.attempt_count);
        let result = match timeout(
            self.cfg.delivery_timeout,
            self.delivery
                .send(&ctx.credential, &item.recipient, &payload, &token),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => DeliveryResult::rejected(
                TIMEOUT,
                format!(
                    "provider call exceeded {}ms",
                    self.cfg.delivery_timeout.as_millis()
                ),
            ),
        };

        // 5) classify
        if result.success {
            return self.finish_sent(item, &ctx, result.provider_message_id).await;
        }

        let code = result.error_code.as_deref().unwrap_or("UNKNOWN");
        let message = result.error_message.as_deref().unwrap_or("");
        let last_error = format!("{code}: {message}");

        match self.cfg.classifier.classify(result.error_code.as_deref()) {
            ErrorClass::Permanent => {
                self.finish_failed(item, FailureCode::TemplateRejected, &last_error, None)
                    .await
            }
            ErrorClass::RateLimited => {
                warn!(channel_id = %ctx.channel_id, error_code = code, "channel rate limited by provider");
                if let Err(e) = self.store.flag_channel_capacity(ctx.channel_id).await {
                    warn!(channel_id = %ctx.channel_id, error = %e, "failed to set capacity flag");
                }
                self.retry_or_exhaust(item, &last_error).await
            }
            ErrorClass::Retryable => self.retry_or_exhaust(item, &last_error).await,
        }
    }

    // 6) retry vs exhausted
    async fn retry_or_exhaust(
        &self,
        item: &QueueItem,
        last_error: &str,
    ) -> anyhow::Result<ItemOutcome> {
        if item.attempt_count >= self.cfg.max_retries {
            let detail = format!(
                "retries exhausted after {} attempts; last error {last_error}",
                item.attempt_count
            );
            return self
                .finish_failed(item, FailureCode::RetriesExhausted, &detail, None)
                .await;
        }

        let attempt_count = item.attempt_count + 1;
        let next_attempt_at = self.cfg.backoff.next_attempt_at(Utc::now(), attempt_count);
        self.store
            .requeue(item.id, attempt_count, next_attempt_at)
            .await?;

        debug!(
            item_id = %item.id,
            attempt_count,
            next_attempt_at = %next_attempt_at,
            last_error,
            "queue item requeued"
        );
        Ok(ItemOutcome::Requeued)
    }

    // 7-9) success path
    async fn finish_sent(
        &self,
        item: &QueueItem,
        ctx: &DispatchContext,
        provider_message_id: Option<String>,
    ) -> anyhow::Result<ItemOutcome> {
        // the provider already has the message: nothing past this point may retry
        if let Err(e) = self
            .store
            .mark_delivered(item.id, provider_message_id.as_deref())
            .await
        {
            warn!(item_id = %item.id, error = %e, "could not mark item delivered");
        }

        let conversation_id = match self
            .procedures
            .resolve_or_create_conversation(&item.recipient, ctx.channel_id, &ctx.segment)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                let detail = format!("sent to provider but conversation logging failed: {e}");
                return self
                    .finish_failed(
                        item,
                        FailureCode::ConversationResolutionFailed,
                        &detail,
                        provider_message_id,
                    )
                    .await;
            }
        };

        let record = NewMessageRecord {
            conversation_id,
            content_type: "template".to_string(),
            sender_type: "system".to_string(),
            template_ref: Some(ctx.template.name.clone()),
            variables: Some(item.variables.clone()),
            media_ref: item.media_ref.clone(),
            provider_message_id: provider_message_id.clone(),
            sender_override: None,
        };
        let warning = match self.procedures.insert_message_record(&record).await {
            Ok(_) => None,
            Err(e) => {
                warn!(item_id = %item.id, %conversation_id, error = %e, "message record not saved");
                Some(truncate_reason(
                    &format!("message record not saved: {e}"),
                    MAX_REASON_CHARS,
                ))
            }
        };

        self.store
            .record_outcome(&SendOutcome {
                batch_id: item.batch_id,
                recipient: item.recipient.clone(),
                status: OutcomeStatus::Sent,
                provider_message_id,
                failure_reason: None,
                warning,
            })
            .await?;
        self.store.delete(item.id).await?;

        Ok(ItemOutcome::Sent)
    }

    async fn finish_failed(
        &self,
        item: &QueueItem,
        code: FailureCode,
        detail: &str,
        provider_message_id: Option<String>,
    ) -> anyhow::Result<ItemOutcome> {
        let reason = truncate_reason(&format!("{}: {detail}", code.as_str()), MAX_REASON_CHARS);
        warn!(item_id = %item.id, failure = code.as_str(), detail, "queue item failed permanently");

        self.store
            .record_outcome(&SendOutcome {
                batch_id: item.batch_id,
                recipient: item.recipient.clone(),
                status: OutcomeStatus::Failed,
                provider_message_id,
                failure_reason: Some(reason),
                warning: None,
            })
            .await?;
        self.store.delete(item.id).await?;

        Ok(ItemOutcome::Failed)
    }
}
