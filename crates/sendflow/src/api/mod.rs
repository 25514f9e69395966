use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::assign::{AssignSummary, AssignmentRepo, AssignmentScheduler};
use crate::queue::error_codes::suggested_action;
use crate::queue::model::SendOutcomeRow;
use crate::queue::{QueueProcessor, QueueRepo, RunSummary};

#[derive(Clone)]
pub struct ApiState {
    pub queue: QueueRepo,
    pub assignments: AssignmentRepo,
    pub processor: QueueProcessor,
    pub scheduler: AssignmentScheduler,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        // Manual triggers
        .route("/queue/run", post(run_queue))
        .route("/assignments/run", post(run_assignments))
        // Inspect
        .route("/outcomes/:batch_id", get(get_outcome))
        // Metrics
        .route("/metrics", get(metrics))
        .route("/metrics/prom", get(metrics_prom))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

fn internal_err(e: anyhow::Error) -> (StatusCode, String) {
    warn!(error = %e, "admin request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("internal error: {e}"),
    )
}

pub async fn run_queue(
    State(state): State<ApiState>,
) -> Result<Json<RunSummary>, (StatusCode, String)> {
    let summary = state.processor.run_once().await.map_err(internal_err)?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct AssignRunQuery {
    pub segment: Option<String>,
}

pub async fn run_assignments(
    State(state): State<ApiState>,
    Query(q): Query<AssignRunQuery>,
) -> Result<Json<AssignSummary>, (StatusCode, String)> {
    let segment = q.segment.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let summary = state
        .scheduler
        .run_once(segment)
        .await
        .map_err(internal_err)?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct OutcomeQuery {
    pub recipient: String,
}

#[derive(Debug, Serialize)]
pub struct OutcomeResponse {
    #[serde(flatten)]
    pub outcome: SendOutcomeRow,
    pub suggested_action: Option<&'static str>,
}

pub async fn get_outcome(
    State(state): State<ApiState>,
    Path(batch_id): Path<Uuid>,
    Query(q): Query<OutcomeQuery>,
) -> Result<Json<OutcomeResponse>, (StatusCode, String)> {
    let Some(outcome) = state
        .queue
        .get_outcome(batch_id, &q.recipient)
        .await
        .map_err(internal_err)?
    else {
        return Err((StatusCode::NOT_FOUND, "no outcome recorded".into()));
    };

    let action = outcome.failure_reason.as_deref().map(suggested_action);
    Ok(Json(OutcomeResponse {
        outcome,
        suggested_action: action,
    }))
}

#[derive(Debug, Serialize)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub now_utc: DateTime<Utc>,
    pub queue_depth: Vec<StatusCount>,
    pub rate_limited_channels: Vec<Uuid>,
    pub unassigned_conversations: i64,
}

async fn snapshot(state: &ApiState) -> anyhow::Result<MetricsResponse> {
    let queue_depth = state
        .queue
        .depth_by_status()
        .await?
        .into_iter()
        .map(|(status, count)| StatusCount { status, count })
        .collect();

    Ok(MetricsResponse {
        now_utc: Utc::now(),
        queue_depth,
        rate_limited_channels: state.queue.rate_limited_channels().await?,
        unassigned_conversations: state.assignments.unassigned_count().await?,
    })
}

pub async fn metrics(
    State(state): State<ApiState>,
) -> Result<Json<MetricsResponse>, (StatusCode, String)> {
    let snap = snapshot(&state).await.map_err(internal_err)?;
    Ok(Json(snap))
}

pub async fn metrics_prom(State(state): State<ApiState>) -> Response {
    // Minimal Prometheus text format (no extra crate needed).
    match snapshot(&state).await {
        Ok(snap) => (StatusCode::OK, render_prom(&snap)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics error: {e}"),
        )
            .into_response(),
    }
}

fn render_prom(snap: &MetricsResponse) -> String {
    let mut out = String::from(concat!(
        "# HELP sendflow_queue_depth Queue rows by status\n",
        "# TYPE sendflow_queue_depth gauge\n",
    ));
    for row in &snap.queue_depth {
        out.push_str(&format!(
            "sendflow_queue_depth{{status=\"{}\"}} {}\n",
            row.status, row.count
        ));
    }
    out.push_str(&format!(
        concat!(
            "# HELP sendflow_rate_limited_channels Channels flagged capacity-exhausted\n",
            "# TYPE sendflow_rate_limited_channels gauge\n",
            "sendflow_rate_limited_channels {}\n",
            "# HELP sendflow_unassigned_conversations Open conversations without an agent\n",
            "# TYPE sendflow_unassigned_conversations gauge\n",
            "sendflow_unassigned_conversations {}\n"
        ),
        snap.rate_limited_channels.len(),
        snap.unassigned_conversations
    ));
    out
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
