//! Database-side procedures the core calls but does not implement.
//!
//! `resolve_or_create_conversation`, `insert_message_record` and
//! `assign_conversation` own the conversation business rules; this module
//! only binds arguments and classifies their errors.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::assign::model::Conversation;

/// SQLSTATE raised by `assign_conversation` when `expected_version` is stale.
const SQLSTATE_VERSION_CONFLICT: &str = "40001";
/// SQLSTATE raised when the conversation is gone or no longer open.
const SQLSTATE_NOT_FOUND: &str = "P0002";

#[derive(Debug, Clone)]
pub struct NewMessageRecord {
    pub conversation_id: Uuid,
    pub content_type: String,
    pub sender_type: String,
    pub template_ref: Option<String>,
    pub variables: Option<Value>,
    pub media_ref: Option<String>,
    pub provider_message_id: Option<String>,
    pub sender_override: Option<String>,
}

#[async_trait]
pub trait MessagingProcedures: Send + Sync {
    async fn resolve_or_create_conversation(
        &self,
        recipient: &str,
        channel_id: Uuid,
        segment: &str,
    ) -> anyhow::Result<Uuid>;

    async fn insert_message_record(&self, record: &NewMessageRecord) -> anyhow::Result<Uuid>;
}

#[derive(Debug, Error)]
pub enum AssignError {
    #[error("version conflict: conversation changed since it was read")]
    VersionConflict,

    #[error("conversation not found or no longer open")]
    NotFound,

    #[error("assignment timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("database error: {0}")]
    Database(String),
}

impl AssignError {
    /// Short code used in run summaries.
    pub fn code(&self) -> &'static str {
        match self {
            AssignError::VersionConflict => "VERSION_CONFLICT",
            AssignError::NotFound => "NOT_FOUND",
            AssignError::Timeout(_) => "TIMEOUT",
            AssignError::Database(_) => "DATABASE",
        }
    }

    pub fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            match db.code().as_deref() {
                Some(SQLSTATE_VERSION_CONFLICT) => return AssignError::VersionConflict,
                Some(SQLSTATE_NOT_FOUND) => return AssignError::NotFound,
                _ => {}
            }
        }
        if let sqlx::Error::RowNotFound = err {
            return AssignError::NotFound;
        }
        AssignError::Database(err.to_string())
    }
}

#[derive(Clone)]
pub struct PgProcedures {
    pool: PgPool,
}

impl PgProcedures {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn assign_conversation(
        &self,
        actor_id: &str,
        conversation_id: Uuid,
        agent_id: Uuid,
        reason: &str,
        expected_version: i64,
    ) -> Result<Conversation, AssignError> {
        sqlx::query_as::<_, Conversation>(
            r#"
            SELECT id, status, assigned_agent_id, segment, version, created_at
            FROM assign_conversation($1, $2, $3, $4, $5)
            "#,
        )
        .bind(actor_id)
        .bind(conversation_id)
        .bind(agent_id)
        .bind(reason)
        .bind(expected_version)
        .fetch_one(&self.pool)
        .await
        .map_err(AssignError::from_sqlx)
    }
}

#[async_trait]
impl MessagingProcedures for PgProcedures {
    async fn resolve_or_create_conversation(
        &self,
        recipient: &str,
        channel_id: Uuid,
        segment: &str,
    ) -> anyhow::Result<Uuid> {
        let id: Uuid = sqlx::query_scalar("SELECT resolve_or_create_conversation($1, $2, $3)")
            .bind(recipient)
            .bind(channel_id)
            .bind(segment)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn insert_message_record(&self, record: &NewMessageRecord) -> anyhow::Result<Uuid> {
        let id: Uuid =
            sqlx::query_scalar("SELECT insert_message_record($1, $2, $3, $4, $5, $6, $7, $8)")
                .bind(record.conversation_id)
                .bind(&record.content_type)
                .bind(&record.sender_type)
                .bind(&record.template_ref)
                .bind(&record.variables)
                .bind(&record.media_ref)
                .bind(&record.provider_message_id)
                .bind(&record.sender_override)
                .fetch_one(&self.pool)
                .await?;
        Ok(id)
    }
}
