//! Run records and the parameter types of registry commands.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What happens to the child session once its run has been announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicy {
    /// Keep the record until it is archived.
    #[default]
    Keep,
    /// Evict the record as soon as the announce has been delivered.
    Delete,
}

/// Terminal result of a run. Set at most once per record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunOutcome {
    Ok,
    Error { error: String },
    Timeout,
}

impl RunOutcome {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error { error } => write!(f, "error: {error}"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Lifecycle state of a run record.
///
/// `registered -> active -> (terminated | steer-pending -> (replaced | terminated))`.
/// A replaced run has no record left, so there is no `Replaced` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Registered,
    Active,
    SteerPending,
    Terminated,
}

impl RunState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Active => "active",
            Self::SteerPending => "steer-pending",
            Self::Terminated => "terminated",
        }
    }

    /// Whether the child session still counts as running.
    pub const fn is_live(&self) -> bool {
        !matches!(self, Self::Terminated)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where the requester's messages came from; the announcer routes the
/// completion back there. Opaque to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryContext {
    pub channel: Option<String>,
    pub to: Option<String>,
    pub account_id: Option<String>,
    pub thread_id: Option<String>,
}

/// One spawned sub-agent execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentRun {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    pub requester_display_key: String,
    pub requester_origin: Option<DeliveryContext>,
    pub task: String,
    pub label: Option<String>,
    pub cleanup: CleanupPolicy,
    pub model: Option<String>,
    pub run_timeout_ms: Option<u64>,
    pub state: RunState,
    /// An interrupted run awaiting replacement; its terminal event is
    /// consumed without announcing.
    pub steer_restart: bool,
    pub outcome: Option<RunOutcome>,
    /// Final reply text captured when the run ended, if the executor had one.
    pub round_one_reply: Option<String>,
    /// Claim flag for the announce/cleanup step.
    pub cleanup_handled: bool,
    pub cleanup_completed_at: Option<i64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    /// When the record becomes eligible for eviction by the archive sweeper.
    pub archive_at: Option<i64>,
}

impl SubagentRun {
    pub const fn is_live(&self) -> bool {
        self.state.is_live()
    }

    pub const fn has_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// Parameters for registering a freshly started run.
#[derive(Debug, Clone, Default)]
pub struct RegisterRun {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    /// Defaults to the requester session key when empty.
    pub requester_display_key: String,
    pub requester_origin: Option<DeliveryContext>,
    pub task: String,
    pub label: Option<String>,
    pub cleanup: CleanupPolicy,
    pub model: Option<String>,
    pub run_timeout_ms: Option<u64>,
}

/// Parameters for swapping an interrupted run for its successor.
#[derive(Debug, Clone, Default)]
pub struct ReplaceRun {
    pub previous_run_id: String,
    pub next_run_id: String,
    /// Child session of the successor; the predecessor's when `None`.
    pub next_child_session_key: Option<String>,
    /// Snapshot used for requester lineage when the previous record was
    /// already evicted.
    pub fallback: Option<SubagentRun>,
}

/// How a run finished, as observed by a lifecycle event or executor wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCompletion {
    pub outcome: RunOutcome,
    pub ended_at: Option<i64>,
    pub reply: Option<String>,
}

impl RunCompletion {
    pub const fn new(outcome: RunOutcome) -> Self {
        Self {
            outcome,
            ended_at: None,
            reply: None,
        }
    }
}
