//! Depth and per-requester admission control for spawn requests.

use std::fmt;
use std::sync::Arc;

use hive_core::config::{Config, SubagentLimits};
use hive_core::session_key::resolve_spawn_depth;
use serde::Serialize;

/// Why a spawn request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AdmissionDenied {
    /// The requester is already at the maximum nesting depth.
    #[serde(rename_all = "camelCase")]
    DepthLimit { current_depth: u32, max_depth: u32 },
    /// The requester already has the maximum number of live children.
    #[serde(rename_all = "camelCase")]
    ChildLimit { active: usize, max_children: u32 },
}

impl fmt::Display for AdmissionDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DepthLimit {
                current_depth,
                max_depth,
            } => write!(
                f,
                "sessions_spawn is not allowed at this depth (current depth: {current_depth}, max: {max_depth})"
            ),
            Self::ChildLimit {
                active,
                max_children,
            } => write!(
                f,
                "sessions_spawn has reached max active children for this session ({active}/{max_children})"
            ),
        }
    }
}

/// Result of an admission check. Denials are values, never errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: Option<AdmissionDenied>,
    pub current_depth: u32,
    pub max_depth: u32,
}

impl AdmissionDecision {
    /// Human-readable denial reason.
    pub fn message(&self) -> Option<String> {
        self.reason.map(|reason| reason.to_string())
    }
}

impl fmt::Display for AdmissionDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            Some(reason) => write!(f, "{reason}"),
            None => write!(f, "allowed (depth {}/{})", self.current_depth, self.max_depth),
        }
    }
}

/// Evaluates spawn requests against the configured limits.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    config: Arc<Config>,
}

impl AdmissionController {
    pub const fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Decide whether `requester_session_key` may spawn another child.
    ///
    /// `stored_depth` is the session store's `spawnDepth` for the requester,
    /// if any; `active_children` is the requester's live run count.
    pub fn evaluate(
        &self,
        requester_session_key: &str,
        requester_agent_id: &str,
        stored_depth: Option<i64>,
        active_children: usize,
    ) -> AdmissionDecision {
        let current_depth = resolve_spawn_depth(requester_session_key, stored_depth);
        self.evaluate_depth(current_depth, requester_agent_id, active_children)
    }

    /// Same as [`evaluate`](Self::evaluate) with an already-resolved depth.
    pub fn evaluate_depth(
        &self,
        current_depth: u32,
        requester_agent_id: &str,
        active_children: usize,
    ) -> AdmissionDecision {
        let limits = SubagentLimits::resolve(&self.config, requester_agent_id);
        Self::decide(current_depth, &limits, active_children)
    }

    fn decide(
        current_depth: u32,
        limits: &SubagentLimits,
        active_children: usize,
    ) -> AdmissionDecision {
        let max_depth = limits.max_spawn_depth;
        let reason = if current_depth >= max_depth {
            Some(AdmissionDenied::DepthLimit {
                current_depth,
                max_depth,
            })
        } else {
            limits
                .max_children_per_agent
                .filter(|max| active_children >= usize::try_from(*max).unwrap_or(usize::MAX))
                .map(|max_children| AdmissionDenied::ChildLimit {
                    active: active_children,
                    max_children,
                })
        };

        AdmissionDecision {
            allowed: reason.is_none(),
            reason,
            current_depth,
            max_depth,
        }
    }
}
