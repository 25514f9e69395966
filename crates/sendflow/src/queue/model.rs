use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Longest failure reason stored on an outcome row.
pub const MAX_REASON_CHARS: usize = 500;

/// One pending outbound message.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueItem {
    pub id: Uuid,
    pub batch_id: Uuid,

    pub recipient: String,
    pub variables: Value,
    pub media_ref: Option<String>,

    pub attempt_count: i32,
    pub status: String,
    pub next_attempt_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Set once the provider has accepted the message.
    pub provider_message_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub batch_id: Uuid,
    pub recipient: String,
    pub variables: Value,
    pub media_ref: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Processing,
    RetryQueued,
    /// Provider accepted the send; only the terminal write is left.
    Delivered,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::RetryQueued => "retry_queued",
            QueueStatus::Delivered => "delivered",
        }
    }
}

/// Batch -> template + channel join, every column nullable so a broken
/// reference shows up as a missing field instead of a query error.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct DispatchRow {
    pub template_name: Option<String>,
    pub template_language: Option<String>,
    pub template_components: Option<Value>,
    pub channel_id: Option<Uuid>,
    pub phone_number_id: Option<String>,
    pub access_token: Option<String>,
    pub segment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub language: String,
    pub components: Value,
}

#[derive(Clone)]
pub struct ChannelCredential {
    pub phone_number_id: String,
    pub access_token: String,
}

impl std::fmt::Debug for ChannelCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCredential")
            .field("phone_number_id", &self.phone_number_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Everything needed to send one queue item, resolved from its batch.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub template: Template,
    pub channel_id: Uuid,
    pub credential: ChannelCredential,
    pub segment: String,
}

impl DispatchRow {
    /// Returns the names of the missing fields when the join is incomplete.
    pub fn into_context(self) -> Result<DispatchContext, Vec<&'static str>> {
        let mut missing = Vec::new();

        let name = non_blank(self.template_name);
        if name.is_none() {
            missing.push("template");
        }
        let channel_id = self.channel_id;
        if channel_id.is_none() {
            missing.push("channel");
        }
        let phone_number_id = non_blank(self.phone_number_id);
        if channel_id.is_some() && phone_number_id.is_none() {
            missing.push("phone_number_id");
        }
        let access_token = non_blank(self.access_token);
        if channel_id.is_some() && access_token.is_none() {
            missing.push("access_token");
        }
        let segment = non_blank(self.segment);
        if channel_id.is_some() && segment.is_none() {
            missing.push("segment");
        }

        match (name, channel_id, phone_number_id, access_token, segment) {
            (Some(name), Some(channel_id), Some(phone_number_id), Some(access_token), Some(segment)) => {
                Ok(DispatchContext {
                    template: Template {
                        name,
                        language: non_blank(self.template_language)
                            .unwrap_or_else(|| "en".to_string()),
                        components: self.template_components.unwrap_or(Value::Array(Vec::new())),
                    },
                    channel_id,
                    credential: ChannelCredential {
                        phone_number_id,
                        access_token,
                    },
                    segment,
                })
            }
            _ => Err(missing),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Sent,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Sent => "sent",
            OutcomeStatus::Failed => "failed",
        }
    }
}

/// Final delivery status for one (batch, recipient) pair.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub batch_id: Uuid,
    pub recipient: String,
    pub status: OutcomeStatus,
    pub provider_message_id: Option<String>,
    pub failure_reason: Option<String>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct SendOutcomeRow {
    pub batch_id: Uuid,
    pub recipient: String,
    pub status: String,
    pub provider_message_id: Option<String>,
    pub failure_reason: Option<String>,
    pub warning: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Cuts `reason` to at most `max_chars` characters, on a char boundary.
pub fn truncate_reason(reason: &str, max_chars: usize) -> String {
    match reason.char_indices().nth(max_chars) {
        Some((idx, _)) => reason[..idx].to_string(),
        None => reason.to_string(),
    }
}
