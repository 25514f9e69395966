//! Provider boundary: one call sends one template message.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::queue::error_codes::{TIMEOUT, TRANSPORT};
use crate::queue::model::ChannelCredential;

/// Classified result of one send. Never an `Err`: transport problems are
/// reported as a failed result with a local error code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub success: bool,
    pub provider_message_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl DeliveryResult {
    pub fn accepted(provider_message_id: Option<String>) -> Self {
        Self {
            success: true,
            provider_message_id,
            error_code: None,
            error_message: None,
        }
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            provider_message_id: None,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn send(
        &self,
        credential: &ChannelCredential,
        recipient: &str,
        template_payload: &Value,
        idempotency_token: &str,
    ) -> DeliveryResult;
}

/// Token that stays the same for every provider-side retry of one attempt.
pub fn idempotency_token(item_id: uuid::Uuid, attempt_count: i32) -> String {
    format!("{item_id}:{attempt_count}")
}

/// WhatsApp Cloud (Graph API) messages endpoint.
#[derive(Debug, Clone)]
pub struct GraphApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl GraphApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn messages_url(&self, phone_number_id: &str) -> String {
        format!("{}/{}/messages", self.base_url, phone_number_id)
    }
}

#[async_trait]
impl DeliveryClient for GraphApiClient {
    async fn send(
        &self,
        credential: &ChannelCredential,
        recipient: &str,
        template_payload: &Value,
        idempotency_token: &str,
    ) -> DeliveryResult {
        let body = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": recipient,
            "type": "template",
            "template": template_payload,
        });

        let response = self
            .client
            .post(self.messages_url(&credential.phone_number_id))
            .bearer_auth(&credential.access_token)
            .header("Idempotency-Key", idempotency_token)
            .json(&body)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return DeliveryResult::rejected(TIMEOUT, format!("provider timed out: {e}"))
            }
            Err(e) => {
                return DeliveryResult::rejected(TRANSPORT, format!("provider unreachable: {e}"))
            }
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(t) => t,
            Err(e) => {
                return DeliveryResult::rejected(TRANSPORT, format!("failed reading response: {e}"))
            }
        };
        debug!(status = %status, "provider response received");

        parse_response(status, &text)
    }
}

#[derive(Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Deserialize)]
struct SentMessage {
    id: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    code: Option<Value>,
    message: Option<String>,
    error_data: Option<ErrorData>,
}

#[derive(Deserialize)]
struct ErrorData {
    details: Option<String>,
}

/// Turns an HTTP status + body into a classified result.
pub fn parse_response(status: StatusCode, body: &str) -> DeliveryResult {
    if status.is_success() {
        // a 2xx without a parseable id is still an accepted send
        let id = serde_json::from_str::<SendResponse>(body)
            .ok()
            .and_then(|r| r.messages.into_iter().next())
            .and_then(|m| m.id)
            .filter(|id| !id.is_empty());
        return DeliveryResult::accepted(id);
    }

    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(env) => {
            let code = match env.error.code {
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::String(s)) if !s.trim().is_empty() => s,
                _ => format!("HTTP_{}", status.as_u16()),
            };
            let mut message = env.error.message.unwrap_or_else(|| status.to_string());
            if let Some(details) = env.error.error_data.and_then(|d| d.details) {
                message = format!("{message} ({details})");
            }
            DeliveryResult::rejected(code, message)
        }
        Err(_) => DeliveryResult::rejected(
            format!("HTTP_{}", status.as_u16()),
            if body.trim().is_empty() {
                status.to_string()
            } else {
                body.to_string()
            },
        ),
    }
}
