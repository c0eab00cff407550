//! Sub-agent spawn manager.
//!
//! [`SubagentManager`] is the high-level coordinator that:
//! - admits spawn requests (depth and per-requester limits)
//! - reserves a slot on the global [`SpawnLane`]
//! - derives the child session key and records its depth in the session store
//! - starts the run on the external executor and registers it
//! - watches the run until it ends or its timeout elapses
//! - steers (restarts) and kills running sub-agents

use std::sync::Arc;
use std::time::Duration;

use hive_core::config::{Config, SubagentLimits};
use hive_core::session_key::{
    DEFAULT_AGENT_ID, derive_child_session_key, normalize_agent_id, resolve_agent_id,
};
use hive_core::timeout::{TimeoutRequest, resolve_agent_timeout_ms};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::storage::{Database, DatabaseError};

use super::admission::{AdmissionController, AdmissionDecision};
use super::executor::{ExecutorError, RunExecutor, RunSpec, SUBAGENT_LANE, WaitStatus};
use super::pool::SpawnLane;
use super::registry::SubagentRegistry;
use super::types::{
    CleanupPolicy, DeliveryContext, RegisterRun, ReplaceRun, RunCompletion, RunOutcome,
};

/// Longest single wait call issued to the executor.
const WAIT_WINDOW_MS: u64 = 30_000;

/// Pause after a failed wait call before polling again.
const WAIT_RETRY_BACKOFF_MS: u64 = 1_000;

/// A request to spawn a sub-agent.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub requester_session_key: String,
    /// Defaults to the requester session key when empty.
    pub requester_display_key: String,
    pub requester_origin: Option<DeliveryContext>,
    /// Agent that runs the child. Defaults to the requester's agent.
    pub target_agent_id: Option<String>,
    pub task: String,
    pub label: Option<String>,
    pub cleanup: CleanupPolicy,
    pub model: Option<String>,
    /// Provider whose `timeoutMs` is the default run timeout.
    pub provider: Option<String>,
    /// Per-run timeout override in seconds. `0` means no timeout.
    pub run_timeout_seconds: Option<f64>,
}

/// A spawn that passed admission and started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnAccepted {
    pub run_id: String,
    pub child_session_key: String,
    /// Spawn depth of the child session.
    pub depth: u32,
    pub timeout_ms: u64,
}

/// Errors from the spawn manager.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Spawn forbidden: {0}")]
    Forbidden(AdmissionDecision),

    #[error("Spawn lane is full")]
    LaneFull,

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("Subagent run not found: {id}")]
    NotFound { id: String },

    #[error("Subagent run already completed: {id}")]
    AlreadyCompleted { id: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// High-level sub-agent lifecycle manager.
pub struct SubagentManager {
    config: Arc<Config>,
    db: Database,
    registry: Arc<SubagentRegistry>,
    lane: Arc<SpawnLane>,
    executor: Arc<dyn RunExecutor>,
    admission: AdmissionController,
}

impl SubagentManager {
    /// Create a manager. The lane size comes from `maxConcurrent`.
    pub fn new(
        config: Arc<Config>,
        db: Database,
        registry: Arc<SubagentRegistry>,
        executor: Arc<dyn RunExecutor>,
    ) -> Self {
        let limits = SubagentLimits::resolve(&config, DEFAULT_AGENT_ID);
        let lane = SpawnLane::new(usize::try_from(limits.max_concurrent).unwrap_or(usize::MAX));
        Self::with_lane(config, db, registry, executor, Arc::new(lane))
    }

    /// Create a manager sharing an existing lane.
    pub fn with_lane(
        config: Arc<Config>,
        db: Database,
        registry: Arc<SubagentRegistry>,
        executor: Arc<dyn RunExecutor>,
        lane: Arc<SpawnLane>,
    ) -> Self {
        let admission = AdmissionController::new(Arc::clone(&config));
        Self {
            config,
            db,
            registry,
            lane,
            executor,
            admission,
        }
    }

    pub const fn registry(&self) -> &Arc<SubagentRegistry> {
        &self.registry
    }

    pub const fn lane(&self) -> &Arc<SpawnLane> {
        &self.lane
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    /// Check whether `requester_session_key` may spawn another child.
    pub async fn can_spawn_subagent(
        &self,
        requester_session_key: &str,
        requester_agent_id: &str,
    ) -> AdmissionDecision {
        let stored_depth = match self.db.get_spawn_depth(requester_session_key).await {
            Ok(depth) => depth,
            Err(e) => {
                warn!(requester_session_key, error = %e, "Session store lookup failed, counting key segments");
                None
            }
        };
        let active = self
            .registry
            .count_active_for_requester(requester_session_key);
        self.admission.evaluate(
            requester_session_key,
            requester_agent_id,
            stored_depth,
            active,
        )
    }

    /// Spawn a sub-agent run.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<SpawnAccepted, ManagerError> {
        if request.task.trim().is_empty() {
            return Err(ManagerError::Validation {
                message: "task must not be empty".to_string(),
            });
        }

        let requester_key = request.requester_session_key.as_str();
        let requester_agent_id = resolve_agent_id(requester_key);
        let decision = self
            .can_spawn_subagent(requester_key, &requester_agent_id)
            .await;
        if !decision.allowed {
            info!(
                requester_session_key = requester_key,
                current_depth = decision.current_depth,
                max_depth = decision.max_depth,
                "Spawn denied"
            );
            return Err(ManagerError::Forbidden(decision));
        }

        // Acquire lane permit
        let permit = self.lane.try_acquire().ok_or(ManagerError::LaneFull)?;

        let target_agent_id = request
            .target_agent_id
            .as_deref()
            .map_or_else(|| requester_agent_id.clone(), normalize_agent_id);
        let child_session_key = derive_child_session_key(
            requester_key,
            &target_agent_id,
            &uuid::Uuid::new_v4().to_string(),
        );
        let depth = decision.current_depth.saturating_add(1);

        self.db
            .record_spawned_session(&child_session_key, &target_agent_id, depth, Some(requester_key))
            .await?;

        let timeout_ms = resolve_agent_timeout_ms(
            &self.config,
            &TimeoutRequest {
                override_seconds: request.run_timeout_seconds,
                provider: request.provider.as_deref(),
                ..TimeoutRequest::default()
            },
        );

        let spec = RunSpec {
            session_key: child_session_key.clone(),
            agent_id: target_agent_id,
            message: request.task.clone(),
            model: request.model.clone(),
            timeout_ms,
            spawned_by: requester_key.to_string(),
            label: request.label.clone(),
            lane: SUBAGENT_LANE.to_string(),
        };

        let run_id = match self.start_run(spec).await {
            Ok(run_id) => run_id,
            Err(e) => {
                if let Err(db_err) = self.db.delete_session(&child_session_key).await {
                    warn!(child_session_key = %child_session_key, error = %db_err, "Failed to drop session after start failure");
                }
                return Err(e.into());
            }
        };

        self.registry.register(RegisterRun {
            run_id: run_id.clone(),
            child_session_key: child_session_key.clone(),
            requester_session_key: request.requester_session_key,
            requester_display_key: request.requester_display_key,
            requester_origin: request.requester_origin,
            task: request.task,
            label: request.label,
            cleanup: request.cleanup,
            model: request.model,
            run_timeout_ms: Some(timeout_ms),
        });
        self.lane.occupy(&run_id, permit, &child_session_key);
        self.spawn_watcher(run_id.clone(), timeout_ms);

        info!(
            run_id = %run_id,
            child_session_key = %child_session_key,
            depth,
            timeout_ms,
            "Subagent spawned"
        );

        Ok(SpawnAccepted {
            run_id,
            child_session_key,
            depth,
            timeout_ms,
        })
    }

    /// Interrupt a running sub-agent and restart it with a new message.
    ///
    /// On success the successor run inherits the requester lineage and is the
    /// only one that announces. If the successor cannot be started, the
    /// original run's announce is released instead.
    ///
    /// The successor keeps the interrupted run's child session key, so the
    /// child transcript continues in the same session.
    pub async fn steer(&self, run_id: &str, message: &str) -> Result<String, ManagerError> {
        if message.trim().is_empty() {
            return Err(ManagerError::Validation {
                message: "steer message must not be empty".to_string(),
            });
        }

        let snapshot = self
            .registry
            .get(run_id)
            .ok_or_else(|| ManagerError::NotFound {
                id: run_id.to_string(),
            })?;
        if !self.registry.mark_for_steer_restart(run_id) {
            return Err(ManagerError::AlreadyCompleted {
                id: run_id.to_string(),
            });
        }

        if let Err(e) = self.executor.abort(run_id).await {
            warn!(run_id, error = %e, "Failed to interrupt run for steer");
        }

        let timeout_ms = snapshot.run_timeout_ms.unwrap_or_else(|| {
            resolve_agent_timeout_ms(&self.config, &TimeoutRequest::default())
        });
        let spec = RunSpec {
            session_key: snapshot.child_session_key.clone(),
            agent_id: resolve_agent_id(&snapshot.child_session_key),
            message: message.to_string(),
            model: snapshot.model.clone(),
            timeout_ms,
            spawned_by: snapshot.requester_session_key.clone(),
            label: snapshot.label.clone(),
            lane: SUBAGENT_LANE.to_string(),
        };

        let next_run_id = match self.start_run(spec).await {
            Ok(next_run_id) => next_run_id,
            Err(e) => {
                warn!(run_id, error = %e, "Steer restart failed, releasing original run");
                self.registry.clear_steer_restart(run_id).await;
                return Err(e.into());
            }
        };

        let child_session_key = snapshot.child_session_key.clone();
        self.registry.replace_after_steer(ReplaceRun {
            previous_run_id: run_id.to_string(),
            next_run_id: next_run_id.clone(),
            next_child_session_key: None,
            fallback: Some(snapshot),
        });

        if !self.lane.transfer(run_id, &next_run_id) {
            match self.lane.try_acquire() {
                Some(permit) => self.lane.occupy(&next_run_id, permit, &child_session_key),
                None => warn!(next_run_id = %next_run_id, "Spawn lane full, steered run holds no slot"),
            }
        }
        self.spawn_watcher(next_run_id.clone(), timeout_ms);

        info!(previous_run_id = run_id, next_run_id = %next_run_id, "Subagent steered");
        Ok(next_run_id)
    }

    /// Kill every live run of a child session. Returns how many records were
    /// terminated; killing an already-terminated session returns 0.
    ///
    /// Lane slots still held under the session are released even when their
    /// run already ended and its watcher has not caught up yet.
    pub async fn kill(&self, child_session_key: &str, reason: &str) -> usize {
        let run_ids = self.registry.active_run_ids_for_session(child_session_key);
        let updated = self.registry.mark_terminated(child_session_key, reason);

        for run_id in &run_ids {
            if let Err(e) = self.executor.abort(run_id).await {
                warn!(run_id, error = %e, "Failed to abort killed run");
            }
        }
        for run_id in self.lane.runs_for_session(child_session_key) {
            self.lane.release(&run_id);
        }
        updated
    }

    async fn start_run(&self, spec: RunSpec) -> Result<String, ExecutorError> {
        let run_id = self.executor.start(spec).await?;
        if run_id.trim().is_empty() {
            return Err(ExecutorError::Rejected {
                reason: "executor returned an empty run id".to_string(),
            });
        }
        Ok(run_id)
    }

    fn spawn_watcher(&self, run_id: String, timeout_ms: u64) {
        let watcher = RunWatcher {
            registry: Arc::clone(&self.registry),
            lane: Arc::clone(&self.lane),
            executor: Arc::clone(&self.executor),
        };
        tokio::spawn(async move {
            watcher.watch(&run_id, timeout_ms).await;
        });
    }
}

/// Polls the executor for one run and feeds its terminal result into the
/// registry.
struct RunWatcher {
    registry: Arc<SubagentRegistry>,
    lane: Arc<SpawnLane>,
    executor: Arc<dyn RunExecutor>,
}

impl RunWatcher {
    async fn watch(&self, run_id: &str, timeout_ms: u64) {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            // Stop once the run was replaced, killed, or ended via the bus.
            match self.registry.get(run_id) {
                Some(run) if run.is_live() && !run.has_ended() => {}
                _ => break,
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                info!(run_id, timeout_ms, "Subagent run timed out");
                if let Err(e) = self.executor.abort(run_id).await {
                    warn!(run_id, error = %e, "Failed to abort timed out run");
                }
                self.registry
                    .complete_run(run_id, RunCompletion::new(RunOutcome::Timeout))
                    .await;
                break;
            }
            let window_ms = u64::try_from(remaining.as_millis())
                .unwrap_or(u64::MAX)
                .clamp(1, WAIT_WINDOW_MS);

            let result = match self.executor.wait(run_id, window_ms).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(run_id, error = %e, "Wait on subagent run failed");
                    tokio::time::sleep(Duration::from_millis(window_ms.min(WAIT_RETRY_BACKOFF_MS)))
                        .await;
                    continue;
                }
            };

            if result.started_at.is_some() {
                self.registry.mark_started(run_id, result.started_at);
            }

            let outcome = match result.status {
                WaitStatus::Running => continue,
                WaitStatus::Ok => RunOutcome::Ok,
                WaitStatus::Timeout => RunOutcome::Timeout,
                WaitStatus::Error => RunOutcome::error(
                    result.error.unwrap_or_else(|| "unknown error".to_string()),
                ),
            };
            self.registry
                .complete_run(
                    run_id,
                    RunCompletion {
                        outcome,
                        ended_at: result.ended_at,
                        reply: result.reply,
                    },
                )
                .await;
            break;
        }

        self.lane.release(run_id);
        debug!(run_id, "Run watcher finished");
    }
}
