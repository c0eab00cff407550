//! Run executor contract.
//!
//! The agent execution engine is external. The control plane only starts
//! runs, waits on them in bounded windows, and (for steer restarts) asks for
//! an in-flight run to be interrupted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Lane name sub-agent runs are scheduled on.
pub const SUBAGENT_LANE: &str = "subagent";

/// What to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    pub session_key: String,
    pub agent_id: String,
    pub message: String,
    pub model: Option<String>,
    pub timeout_ms: u64,
    pub spawned_by: String,
    pub label: Option<String>,
    pub lane: String,
}

/// Status returned by a wait call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStatus {
    Ok,
    Error,
    Timeout,
    /// The wait window elapsed while the run was still going.
    Running,
}

/// Result of a wait call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitResult {
    pub status: WaitStatus,
    pub error: Option<String>,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub reply: Option<String>,
}

impl WaitResult {
    pub const fn status(status: WaitStatus) -> Self {
        Self {
            status,
            error: None,
            started_at: None,
            ended_at: None,
            reply: None,
        }
    }
}

/// Errors from the run executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Run rejected by executor: {reason}")]
    Rejected { reason: String },

    #[error("Executor call failed: {0}")]
    Transport(String),
}

/// The external agent execution engine.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    /// Start a run and return its run id.
    async fn start(&self, spec: RunSpec) -> Result<String, ExecutorError>;

    /// Wait up to `timeout_ms` for the run to finish.
    async fn wait(&self, run_id: &str, timeout_ms: u64) -> Result<WaitResult, ExecutorError>;

    /// Interrupt an in-flight run. Returns whether anything was interrupted.
    async fn abort(&self, _run_id: &str) -> Result<bool, ExecutorError> {
        Ok(false)
    }
}
