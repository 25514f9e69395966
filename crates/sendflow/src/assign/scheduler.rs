use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::assign::model::{AssignFailure, AssignSummary, Conversation};
use crate::assign::roster::{Pick, RosterCache};
use crate::assign::store::AssignmentStore;
use crate::assign::DEFAULT_LOCK_KEY;
use crate::procedures::AssignError;

/// Reason tag written with every automatic assignment.
pub const ASSIGN_REASON: &str = "round-robin";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub actor_id: String,
    pub chunk_size: i64,
    pub lock_key: i64,
    pub max_failure_details: usize,
    pub db_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            actor_id: "sendflow-scheduler".to_string(),
            chunk_size: 200,
            lock_key: DEFAULT_LOCK_KEY,
            max_failure_details: 1000,
            db_timeout: Duration::from_secs(25),
        }
    }
}

#[derive(Clone)]
pub struct AssignmentScheduler {
    store: Arc<dyn AssignmentStore>,
    cfg: SchedulerConfig,
}

impl AssignmentScheduler {
    pub fn new(store: Arc<dyn AssignmentStore>, cfg: SchedulerConfig) -> Self {
        Self { store, cfg }
    }

    /// One pass over the unassigned backlog, optionally limited to a segment.
    ///
    /// Returns `RunningElsewhere` without touching anything if another run
    /// holds the lock. Per-conversation problems land in the summary; a
    /// failed chunk fetch aborts the run and drops the lock with it.
    pub async fn run_once(&self, segment: Option<&str>) -> anyhow::Result<AssignSummary> {
        let lease = match self
            .bounded("acquire run lock", self.store.try_acquire_exclusive_run(self.cfg.lock_key))
            .await?
        {
            Some(lease) => lease,
            None => {
                info!(segment = ?segment, "assignment run already in progress elsewhere");
                return Ok(AssignSummary::running_elsewhere());
            }
        };

        let mut summary = AssignSummary::completed();
        let mut roster = RosterCache::new();
        let mut after = None;
        let chunk_size = self.cfg.chunk_size.max(1);

        loop {
            let chunk = self
                .bounded(
                    "fetch unassigned conversations",
                    self.store.fetch_unassigned_chunk(segment, after, chunk_size),
                )
                .await?;
            debug!(rows = chunk.len(), "fetched unassigned chunk");

            for conv in &chunk {
                self.assign_one(conv, &mut roster, &mut summary).await;
            }

            match chunk.last() {
                Some(last) => after = Some((last.created_at, last.id)),
                None => break,
            }
            if (chunk.len() as i64) < chunk_size {
                break;
            }
        }

        // assignments are already committed on their own; only the lock rides on this
        if let Err(e) = self.bounded("release run lock", lease.release()).await {
            warn!(error = %e, "releasing assignment lock failed");
        }

        if summary.assigned > 0 || summary.failed > 0 {
            info!(
                segment = ?segment,
                assigned = summary.assigned,
                failed = summary.failed,
                truncated = summary.failures_truncated,
                "assignment run finished"
            );
        }

        Ok(summary)
    }

    async fn assign_one(
        &self,
        conv: &Conversation,
        roster: &mut RosterCache,
        summary: &mut AssignSummary,
    ) {
        if !roster.contains(&conv.segment) {
            self.load_roster(&conv.segment, roster).await;
        }

        let agent_id = match roster.next_agent(&conv.segment) {
            Pick::Agent(id) => id,
            Pick::NoAgent(reason) => {
                self.fail(conv, reason, summary);
                return;
            }
            Pick::Unknown => {
                self.fail(conv, "roster unavailable".to_string(), summary);
                return;
            }
        };

        let commit = self.store.assign_conversation(
            &self.cfg.actor_id,
            conv.id,
            agent_id,
            ASSIGN_REASON,
            conv.version,
        );
        let res = match timeout(self.cfg.db_timeout, commit).await {
            Ok(r) => r,
            Err(_) => Err(AssignError::Timeout(self.cfg.db_timeout)),
        };

        match res {
            Ok(_) => {
                summary.assigned += 1;
                debug!(conversation_id = %conv.id, agent_id = %agent_id, "conversation assigned");
            }
            Err(e) => {
                debug!(conversation_id = %conv.id, code = e.code(), "assignment rejected");
                self.fail(conv, e.to_string(), summary);
            }
        }
    }

    async fn load_roster(&self, segment: &str, roster: &mut RosterCache) {
        match self
            .bounded("load agent roster", self.store.eligible_agents(segment))
            .await
        {
            Ok(agents) => {
                debug!(segment, agents = agents.len(), "roster loaded");
                roster.insert_agents(segment, agents.into_iter().map(|a| a.id).collect());
            }
            Err(e) => {
                warn!(segment, error = %e, "roster fetch failed; segment skipped for this run");
                roster.insert_unavailable(segment, format!("roster unavailable: {e}"));
            }
        }
    }

    fn fail(&self, conv: &Conversation, reason: String, summary: &mut AssignSummary) {
        summary.record_failure(
            AssignFailure {
                conversation_id: conv.id,
                segment: conv.segment.clone(),
                reason,
            },
            self.cfg.max_failure_details,
        );
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match timeout(self.cfg.db_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(anyhow!(
                "{what} timed out after {}ms",
                self.cfg.db_timeout.as_millis()
            )),
        }
    }
}
