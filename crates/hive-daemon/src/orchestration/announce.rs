//! Announce contract.
//!
//! Delivering a finished run's result to the requester's origin channel is
//! done by an external collaborator. The registry decides *whether* and *for
//! which run* to announce; the [`Announcer`] decides *how*.

use async_trait::async_trait;
use serde::Serialize;

use super::types::{CleanupPolicy, DeliveryContext, RunOutcome, SubagentRun};

/// Everything the announcer needs to route and render one completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnounceRequest {
    pub child_run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    pub requester_display_key: String,
    pub requester_origin: Option<DeliveryContext>,
    pub task: String,
    pub label: Option<String>,
    pub cleanup: CleanupPolicy,
    pub outcome: RunOutcome,
    pub round_one_reply: Option<String>,
    pub timeout_ms: Option<u64>,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
}

impl AnnounceRequest {
    pub(crate) fn from_run(run: &SubagentRun) -> Self {
        Self {
            child_run_id: run.run_id.clone(),
            child_session_key: run.child_session_key.clone(),
            requester_session_key: run.requester_session_key.clone(),
            requester_display_key: run.requester_display_key.clone(),
            requester_origin: run.requester_origin.clone(),
            task: run.task.clone(),
            label: run.label.clone(),
            cleanup: run.cleanup,
            outcome: run
                .outcome
                .clone()
                .unwrap_or_else(|| RunOutcome::error("run ended without an outcome")),
            round_one_reply: run.round_one_reply.clone(),
            timeout_ms: run.run_timeout_ms,
            started_at: run.started_at,
            ended_at: run.ended_at,
        }
    }
}

/// Delivers completion announcements.
#[async_trait]
pub trait Announcer: Send + Sync {
    /// Run the announce flow. Returns whether delivery succeeded; the
    /// control plane never retries on its own.
    async fn run_announce_flow(&self, request: AnnounceRequest) -> bool;
}
