//! Sub-agent run registry.
//!
//! [`SubagentRegistry`] is the single owner of every run record. All state
//! transitions happen inside one lock scope and never across an `.await`;
//! announce dispatch runs after the lock is released. The announce side
//! effect is claimed through `cleanup_handled`, which is what keeps it to at
//! most one dispatch per completion, including across steer restarts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hive_core::db::unix_timestamp_ms;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::announce::{AnnounceRequest, Announcer};
use super::lifecycle::{AgentEvent, LifecycleBus, LifecyclePhase, Subscription};
use super::types::{
    CleanupPolicy, RegisterRun, ReplaceRun, RunCompletion, RunOutcome, RunState, SubagentRun,
};

/// Authoritative in-memory store of sub-agent runs.
pub struct SubagentRegistry {
    runs: Mutex<HashMap<String, SubagentRun>>,
    announcer: Arc<dyn Announcer>,
    archive_after_ms: i64,
}

impl SubagentRegistry {
    /// Create an empty registry.
    pub fn new(announcer: Arc<dyn Announcer>, archive_after_minutes: u64) -> Self {
        let archive_after_ms = i64::try_from(archive_after_minutes.saturating_mul(60_000))
            .unwrap_or(i64::MAX);
        Self {
            runs: Mutex::new(HashMap::new()),
            announcer,
            archive_after_ms,
        }
    }

    /// Register a freshly started run.
    pub fn register(&self, params: RegisterRun) {
        let requester_display_key = if params.requester_display_key.trim().is_empty() {
            params.requester_session_key.clone()
        } else {
            params.requester_display_key
        };
        let run = SubagentRun {
            run_id: params.run_id.clone(),
            child_session_key: params.child_session_key,
            requester_session_key: params.requester_session_key,
            requester_display_key,
            requester_origin: params.requester_origin,
            task: params.task,
            label: params.label,
            cleanup: params.cleanup,
            model: params.model,
            run_timeout_ms: params.run_timeout_ms,
            state: RunState::Registered,
            steer_restart: false,
            outcome: None,
            round_one_reply: None,
            cleanup_handled: false,
            cleanup_completed_at: None,
            created_at: unix_timestamp_ms(),
            started_at: None,
            ended_at: None,
            archive_at: None,
        };

        info!(
            run_id = %run.run_id,
            child_session_key = %run.child_session_key,
            requester_session_key = %run.requester_session_key,
            "Registered subagent run"
        );

        if let Some(previous) = self.runs.lock().insert(params.run_id, run) {
            warn!(run_id = %previous.run_id, "Run id re-registered, previous record replaced");
        }
    }

    /// Snapshot of one run.
    pub fn get(&self, run_id: &str) -> Option<SubagentRun> {
        self.runs.lock().get(run_id).cloned()
    }

    /// All runs spawned by a requester, oldest first.
    pub fn list_for_requester(&self, requester_session_key: &str) -> Vec<SubagentRun> {
        let mut runs: Vec<SubagentRun> = self
            .runs
            .lock()
            .values()
            .filter(|run| run.requester_session_key == requester_session_key)
            .cloned()
            .collect();
        runs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        runs
    }

    /// Number of live runs spawned by a requester.
    pub fn count_active_for_requester(&self, requester_session_key: &str) -> usize {
        self.runs
            .lock()
            .values()
            .filter(|run| run.requester_session_key == requester_session_key && run.is_live())
            .count()
    }

    /// Ids of live runs executing under a child session.
    pub fn active_run_ids_for_session(&self, child_session_key: &str) -> Vec<String> {
        self.runs
            .lock()
            .values()
            .filter(|run| run.child_session_key == child_session_key && run.is_live())
            .map(|run| run.run_id.clone())
            .collect()
    }

    /// Whether a live run exists for the child session.
    pub fn is_session_run_active(&self, child_session_key: &str) -> bool {
        self.runs
            .lock()
            .values()
            .any(|run| run.child_session_key == child_session_key && run.is_live())
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.lock().is_empty()
    }

    /// Drop every record.
    pub fn reset(&self) {
        self.runs.lock().clear();
    }

    /// Record that the executor started the run.
    pub fn mark_started(&self, run_id: &str, started_at: Option<i64>) -> bool {
        let mut runs = self.runs.lock();
        let Some(run) = runs.get_mut(run_id) else {
            return false;
        };
        if run.started_at.is_none() {
            run.started_at = Some(started_at.unwrap_or_else(unix_timestamp_ms));
        }
        if run.state == RunState::Registered {
            run.state = RunState::Active;
        }
        true
    }

    /// Flag a live run so that its terminal event is consumed silently.
    ///
    /// Returns `false` for unknown runs and runs that already ended.
    pub fn mark_for_steer_restart(&self, run_id: &str) -> bool {
        let mut runs = self.runs.lock();
        let Some(run) = runs.get_mut(run_id) else {
            return false;
        };
        if run.has_ended() || !run.is_live() {
            return false;
        }
        run.steer_restart = true;
        run.state = RunState::SteerPending;
        info!(run_id, child_session_key = %run.child_session_key, "Run marked for steer restart");
        true
    }

    /// Lift the steer-restart suppression of a run whose replacement never
    /// materialized.
    ///
    /// If the run already ended while suppressed, its announce is released
    /// now (exactly once). Returns `false` only for unknown runs.
    pub async fn clear_steer_restart(&self, run_id: &str) -> bool {
        let request = {
            let mut runs = self.runs.lock();
            let Some(run) = runs.get_mut(run_id) else {
                return false;
            };
            if !run.steer_restart {
                return true;
            }
            run.steer_restart = false;

            if run.has_ended() {
                run.state = RunState::Terminated;
                info!(run_id, "Steer restart abandoned after run ended, releasing announce");
                claim_announce(run)
            } else {
                run.state = if run.started_at.is_some() {
                    RunState::Active
                } else {
                    RunState::Registered
                };
                debug!(run_id, "Steer restart cleared before run ended");
                None
            }
        };

        if let Some(request) = request {
            self.dispatch_announce(request).await;
        }
        true
    }

    /// Swap an interrupted run for its successor.
    ///
    /// Requester lineage comes from the previous record when it is still
    /// present, otherwise from `fallback`. Returns `false` when neither is
    /// available.
    pub fn replace_after_steer(&self, params: ReplaceRun) -> bool {
        let next_run_id = params.next_run_id.trim();
        if next_run_id.is_empty() {
            return false;
        }

        let mut runs = self.runs.lock();
        let Some(source) = runs.remove(&params.previous_run_id).or(params.fallback) else {
            warn!(
                previous_run_id = %params.previous_run_id,
                next_run_id,
                "No lineage available for steer replacement"
            );
            return false;
        };

        let child_session_key = params
            .next_child_session_key
            .unwrap_or_else(|| source.child_session_key.clone());
        let now = unix_timestamp_ms();
        let next = SubagentRun {
            run_id: next_run_id.to_string(),
            child_session_key,
            state: RunState::Active,
            steer_restart: false,
            outcome: None,
            round_one_reply: None,
            cleanup_handled: false,
            cleanup_completed_at: None,
            started_at: Some(now),
            ended_at: None,
            archive_at: None,
            ..source
        };

        info!(
            previous_run_id = %params.previous_run_id,
            next_run_id,
            child_session_key = %next.child_session_key,
            "Replaced subagent run after steer"
        );
        runs.insert(next.run_id.clone(), next);
        true
    }

    /// Kill every live run of a child session.
    ///
    /// Records `outcome = error(reason)` (unless an outcome was already set)
    /// and marks cleanup as done, so no announce follows. Returns the number
    /// of records updated; repeated calls update nothing.
    pub fn mark_terminated(&self, child_session_key: &str, reason: &str) -> usize {
        let now = unix_timestamp_ms();
        let mut updated = 0;
        let mut runs = self.runs.lock();
        for run in runs
            .values_mut()
            .filter(|run| run.child_session_key == child_session_key && run.is_live())
        {
            run.state = RunState::Terminated;
            run.steer_restart = false;
            if run.ended_at.is_none() {
                run.ended_at = Some(now);
            }
            if run.outcome.is_none() {
                run.outcome = Some(RunOutcome::error(reason));
            }
            run.cleanup_handled = true;
            run.cleanup_completed_at = Some(now);
            run.archive_at = Some(now.saturating_add(self.archive_after_ms));
            updated += 1;
            info!(run_id = %run.run_id, child_session_key, reason, "Subagent run terminated");
        }
        updated
    }

    /// Apply a terminal result to a run.
    ///
    /// Unknown runs and runs that already ended are ignored. A run marked for
    /// steer restart records its result but does not announce. Returns the
    /// announce delivery result when an announce was dispatched.
    pub async fn complete_run(&self, run_id: &str, completion: RunCompletion) -> Option<bool> {
        let request = self.record_completion(run_id, completion)?;
        Some(self.dispatch_announce(request).await)
    }

    /// Handle one event from the lifecycle bridge.
    pub async fn handle_event(&self, event: &AgentEvent) -> Option<bool> {
        let request = self.apply_event(event)?;
        Some(self.dispatch_announce(request).await)
    }

    /// Apply the state transition of one event and claim its announce, if
    /// any. The caller dispatches the returned request.
    fn apply_event(&self, event: &AgentEvent) -> Option<AnnounceRequest> {
        let data = event.lifecycle_data()?;
        let outcome = match data.phase {
            LifecyclePhase::Start => {
                self.mark_started(&event.run_id, data.started_at);
                return None;
            }
            LifecyclePhase::End => RunOutcome::Ok,
            LifecyclePhase::Error => {
                RunOutcome::error(data.error.unwrap_or_else(|| "unknown error".to_string()))
            }
            LifecyclePhase::Other => return None,
        };
        self.record_completion(
            &event.run_id,
            RunCompletion {
                outcome,
                ended_at: data.ended_at,
                reply: None,
            },
        )
    }

    /// Record a terminal result under the lock and claim the announce.
    fn record_completion(
        &self,
        run_id: &str,
        completion: RunCompletion,
    ) -> Option<AnnounceRequest> {
        let mut runs = self.runs.lock();
        let Some(run) = runs.get_mut(run_id) else {
            debug!(run_id, "Terminal result for unknown run ignored");
            return None;
        };
        if run.has_ended() || run.state == RunState::Terminated {
            debug!(run_id, "Duplicate terminal result ignored");
            return None;
        }

        run.ended_at = Some(completion.ended_at.unwrap_or_else(unix_timestamp_ms));
        if run.outcome.is_none() {
            run.outcome = Some(completion.outcome);
        }
        if run.round_one_reply.is_none() {
            run.round_one_reply = completion.reply;
        }

        if run.steer_restart {
            debug!(run_id, "Terminal result suppressed by pending steer restart");
            return None;
        }

        run.state = RunState::Terminated;
        info!(
            run_id,
            child_session_key = %run.child_session_key,
            outcome = ?run.outcome,
            "Subagent run ended"
        );
        claim_announce(run)
    }

    /// Re-dispatch an announce whose previous delivery failed.
    ///
    /// Only runs that ended, are not suppressed, and have no completed or
    /// in-flight cleanup qualify.
    pub async fn retry_announce(&self, run_id: &str) -> Option<bool> {
        let request = {
            let mut runs = self.runs.lock();
            let run = runs.get_mut(run_id)?;
            if !run.has_ended() || run.steer_restart || run.cleanup_completed_at.is_some() {
                return None;
            }
            claim_announce(run)?
        };
        Some(self.dispatch_announce(request).await)
    }

    /// Evict records whose archive time has passed. Returns how many.
    pub fn sweep_archived(&self, now_ms: i64) -> usize {
        let mut runs = self.runs.lock();
        let before = runs.len();
        runs.retain(|_, run| run.archive_at.is_none_or(|at| at > now_ms));
        let evicted = before - runs.len();
        if evicted > 0 {
            debug!(evicted, "Archived subagent runs swept");
        }
        evicted
    }

    /// Subscribe to the lifecycle bus until the returned subscription is
    /// dropped.
    ///
    /// State transitions are applied one event at a time in arrival order.
    /// Announces are dispatched on their own tasks so a slow announce flow
    /// does not hold back later events.
    pub fn listen(self: &Arc<Self>, bus: &LifecycleBus) -> Subscription {
        let mut rx = bus.subscribe();
        debug!(subscribers = bus.subscriber_count(), "Lifecycle listener attached");
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(request) = registry.apply_event(&event) else {
                    continue;
                };
                let dispatcher = Arc::clone(&registry);
                tokio::spawn(async move {
                    dispatcher.dispatch_announce(request).await;
                });
            }
            debug!("Lifecycle subscription closed");
        });
        Subscription::new(handle)
    }

    /// Periodically evict archived records.
    pub fn spawn_archive_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep_archived(unix_timestamp_ms());
            }
        })
    }

    async fn dispatch_announce(&self, request: AnnounceRequest) -> bool {
        let run_id = request.child_run_id.clone();
        info!(
            run_id = %run_id,
            requester_session_key = %request.requester_session_key,
            "Announcing subagent completion"
        );
        let delivered = self.announcer.run_announce_flow(request).await;
        self.finalize_cleanup(&run_id, delivered);
        delivered
    }

    fn finalize_cleanup(&self, run_id: &str, delivered: bool) {
        let now = unix_timestamp_ms();
        let mut runs = self.runs.lock();
        let Some(run) = runs.get_mut(run_id) else {
            return;
        };

        run.archive_at = Some(run.ended_at.unwrap_or(now).saturating_add(self.archive_after_ms));
        if !delivered {
            warn!(run_id, "Announce delivery failed, cleanup left pending");
            run.cleanup_handled = false;
            return;
        }

        run.cleanup_completed_at = Some(now);
        if run.cleanup == CleanupPolicy::Delete {
            runs.remove(run_id);
            debug!(run_id, "Run record deleted after announce");
        }
    }
}

/// Claim the announce for `run`, or `None` when it was already claimed.
fn claim_announce(run: &mut SubagentRun) -> Option<AnnounceRequest> {
    if run.cleanup_handled || run.cleanup_completed_at.is_some() {
        return None;
    }
    run.cleanup_handled = true;
    Some(AnnounceRequest::from_run(run))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::orchestration::lifecycle::LifecycleData;

    #[derive(Default)]
    struct RecordingAnnouncer {
        calls: Mutex<Vec<AnnounceRequest>>,
        fail: AtomicBool,
    }

    impl RecordingAnnouncer {
        fn run_ids(&self) -> Vec<String> {
            self.calls
                .lock()
                .iter()
                .map(|r| r.child_run_id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Announcer for RecordingAnnouncer {
        async fn run_announce_flow(&self, request: AnnounceRequest) -> bool {
            self.calls.lock().push(request);
            !self.fail.load(Ordering::SeqCst)
        }
    }

    fn setup() -> (Arc<SubagentRegistry>, Arc<RecordingAnnouncer>) {
        let announcer = Arc::new(RecordingAnnouncer::default());
        let registry = Arc::new(SubagentRegistry::new(announcer.clone(), 60));
        (registry, announcer)
    }

    fn register(registry: &SubagentRegistry, run_id: &str, child: &str) {
        registry.register(RegisterRun {
            run_id: run_id.to_string(),
            child_session_key: child.to_string(),
            requester_session_key: "agent:main:main".to_string(),
            task: "summarize the logs".to_string(),
            ..RegisterRun::default()
        });
    }

    fn end_event(run_id: &str) -> AgentEvent {
        AgentEvent::lifecycle(run_id, &LifecycleData::phase(LifecyclePhase::End))
    }

    #[tokio::test]
    async fn register_then_end_announces_once() {
        let (registry, announcer) = setup();
        register(&registry, "r-1", "agent:main:subagent:a");
        assert!(registry.is_session_run_active("agent:main:subagent:a"));

        assert_eq!(registry.handle_event(&end_event("r-1")).await, Some(true));
        assert_eq!(registry.handle_event(&end_event("r-1")).await, None);

        assert_eq!(announcer.run_ids(), vec!["r-1"]);
        let run = registry.get("r-1").unwrap();
        assert_eq!(run.state, RunState::Terminated);
        assert_eq!(run.outcome, Some(RunOutcome::Ok));
        assert!(run.cleanup_completed_at.is_some());
        assert!(!registry.is_session_run_active("agent:main:subagent:a"));
    }

    #[tokio::test]
    async fn display_key_defaults_to_requester_key() {
        let (registry, _) = setup();
        register(&registry, "r-1", "agent:main:subagent:a");
        assert_eq!(registry.get("r-1").unwrap().requester_display_key, "agent:main:main");
    }

    #[tokio::test]
    async fn start_event_activates_run() {
        let (registry, _) = setup();
        register(&registry, "r-1", "agent:main:subagent:a");
        let start = LifecycleData {
            started_at: Some(42),
            ..LifecycleData::phase(LifecyclePhase::Start)
        };
        registry.handle_event(&AgentEvent::lifecycle("r-1", &start)).await;
        let run = registry.get("r-1").unwrap();
        assert_eq!(run.state, RunState::Active);
        assert_eq!(run.started_at, Some(42));
    }

    #[tokio::test]
    async fn error_phase_records_error_outcome() {
        let (registry, announcer) = setup();
        register(&registry, "r-1", "agent:main:subagent:a");
        let data = LifecycleData {
            error: Some("model overloaded".to_string()),
            ..LifecycleData::phase(LifecyclePhase::Error)
        };
        registry.handle_event(&AgentEvent::lifecycle("r-1", &data)).await;
        assert_eq!(
            registry.get("r-1").unwrap().outcome,
            Some(RunOutcome::error("model overloaded"))
        );
        assert_eq!(announcer.calls.lock()[0].outcome, RunOutcome::error("model overloaded"));
    }

    #[tokio::test]
    async fn terminal_event_for_unknown_run_is_ignored() {
        let (registry, announcer) = setup();
        assert_eq!(registry.handle_event(&end_event("ghost")).await, None);
        assert!(announcer.run_ids().is_empty());
    }

    #[test]
    fn marking_unknown_run_fails() {
        let (registry, _) = setup();
        assert!(!registry.mark_for_steer_restart("ghost"));
    }

    #[tokio::test]
    async fn marking_ended_run_fails() {
        let (registry, _) = setup();
        register(&registry, "r-1", "agent:main:subagent:a");
        registry.handle_event(&end_event("r-1")).await;
        assert!(!registry.mark_for_steer_restart("r-1"));
    }

    #[tokio::test]
    async fn steer_success_path_announces_successor_only() {
        let (registry, announcer) = setup();
        register(&registry, "r-1", "agent:main:subagent:a");

        assert!(registry.mark_for_steer_restart("r-1"));
        assert_eq!(registry.handle_event(&end_event("r-1")).await, None);
        assert!(announcer.run_ids().is_empty());
        assert!(registry.is_session_run_active("agent:main:subagent:a"));

        assert!(registry.replace_after_steer(ReplaceRun {
            previous_run_id: "r-1".to_string(),
            next_run_id: "r-2".to_string(),
            ..ReplaceRun::default()
        }));
        assert!(registry.get("r-1").is_none());

        registry.handle_event(&end_event("r-2")).await;
        assert_eq!(announcer.run_ids(), vec!["r-2"]);
        let announced = &announcer.calls.lock()[0];
        assert_eq!(announced.requester_session_key, "agent:main:main");
        assert_eq!(announced.child_session_key, "agent:main:subagent:a");
        assert_eq!(announced.task, "summarize the logs");
    }

    #[tokio::test]
    async fn steer_failure_path_releases_original_announce() {
        let (registry, announcer) = setup();
        register(&registry, "r-1", "agent:main:subagent:a");

        assert!(registry.mark_for_steer_restart("r-1"));
        registry.handle_event(&end_event("r-1")).await;
        assert!(announcer.run_ids().is_empty());

        assert!(registry.clear_steer_restart("r-1").await);
        assert_eq!(announcer.run_ids(), vec!["r-1"]);

        // Clearing again or replaying the end event must not re-announce.
        assert!(registry.clear_steer_restart("r-1").await);
        registry.handle_event(&end_event("r-1")).await;
        assert_eq!(announcer.run_ids(), vec!["r-1"]);
        assert!(!registry.is_session_run_active("agent:main:subagent:a"));
    }

    #[tokio::test]
    async fn clearing_before_end_restores_normal_announce() {
        let (registry, announcer) = setup();
        register(&registry, "r-1", "agent:main:subagent:a");
        registry.mark_started("r-1", None);

        assert!(registry.mark_for_steer_restart("r-1"));
        assert!(registry.clear_steer_restart("r-1").await);
        assert!(announcer.run_ids().is_empty());
        assert_eq!(registry.get("r-1").unwrap().state, RunState::Active);

        registry.handle_event(&end_event("r-1")).await;
        assert_eq!(announcer.run_ids(), vec!["r-1"]);
    }

    #[tokio::test]
    async fn clearing_unknown_run_fails() {
        let (registry, _) = setup();
        assert!(!registry.clear_steer_restart("ghost").await);
    }

    #[tokio::test]
    async fn replace_uses_fallback_when_previous_evicted() {
        let (registry, announcer) = setup();
        register(&registry, "r-1", "agent:main:subagent:a");
        let snapshot = registry.get("r-1").unwrap();
        registry.reset();

        assert!(registry.replace_after_steer(ReplaceRun {
            previous_run_id: "r-1".to_string(),
            next_run_id: "r-2".to_string(),
            next_child_session_key: Some("agent:main:subagent:b".to_string()),
            fallback: Some(snapshot),
        }));
        let next = registry.get("r-2").unwrap();
        assert_eq!(next.child_session_key, "agent:main:subagent:b");
        assert_eq!(next.requester_session_key, "agent:main:main");

        registry.handle_event(&end_event("r-2")).await;
        assert_eq!(announcer.run_ids(), vec!["r-2"]);
    }

    #[test]
    fn replace_without_lineage_fails() {
        let (registry, _) = setup();
        assert!(!registry.replace_after_steer(ReplaceRun {
            previous_run_id: "ghost".to_string(),
            next_run_id: "r-2".to_string(),
            ..ReplaceRun::default()
        }));
        assert!(registry.is_empty());
    }

    #[test]
    fn replace_with_blank_next_id_fails() {
        let (registry, _) = setup();
        register(&registry, "r-1", "agent:main:subagent:a");
        assert!(!registry.replace_after_steer(ReplaceRun {
            previous_run_id: "r-1".to_string(),
            next_run_id: "  ".to_string(),
            ..ReplaceRun::default()
        }));
        assert!(registry.get("r-1").is_some());
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_suppresses_announce() {
        let (registry, announcer) = setup();
        register(&registry, "r-1", "agent:main:subagent:a");

        assert_eq!(registry.mark_terminated("agent:main:subagent:a", "manual kill"), 1);
        assert!(!registry.is_session_run_active("agent:main:subagent:a"));
        assert_eq!(registry.mark_terminated("agent:main:subagent:a", "again"), 0);
        assert!(!registry.is_session_run_active("agent:main:subagent:a"));

        let run = registry.get("r-1").unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::error("manual kill")));
        assert!(run.cleanup_handled);
        assert!(run.cleanup_completed_at.is_some());

        registry.handle_event(&end_event("r-1")).await;
        assert!(announcer.run_ids().is_empty());
    }

    #[tokio::test]
    async fn terminating_steer_pending_run_blocks_later_clear_announce() {
        let (registry, announcer) = setup();
        register(&registry, "r-1", "agent:main:subagent:a");
        registry.mark_for_steer_restart("r-1");
        registry.handle_event(&end_event("r-1")).await;

        assert_eq!(registry.mark_terminated("agent:main:subagent:a", "killed"), 1);
        // The suppressed end already set the outcome; it is not overwritten.
        assert_eq!(registry.get("r-1").unwrap().outcome, Some(RunOutcome::Ok));

        assert!(registry.clear_steer_restart("r-1").await);
        assert!(announcer.run_ids().is_empty());
    }

    #[tokio::test]
    async fn failed_delivery_can_be_retried_explicitly() {
        let (registry, announcer) = setup();
        announcer.fail.store(true, Ordering::SeqCst);
        register(&registry, "r-1", "agent:main:subagent:a");

        assert_eq!(registry.handle_event(&end_event("r-1")).await, Some(false));
        assert!(!registry.get("r-1").unwrap().cleanup_handled);

        announcer.fail.store(false, Ordering::SeqCst);
        assert_eq!(registry.retry_announce("r-1").await, Some(true));
        assert_eq!(registry.retry_announce("r-1").await, None);
        assert_eq!(announcer.run_ids(), vec!["r-1", "r-1"]);
    }

    #[tokio::test]
    async fn retry_of_live_run_does_nothing() {
        let (registry, announcer) = setup();
        register(&registry, "r-1", "agent:main:subagent:a");
        assert_eq!(registry.retry_announce("r-1").await, None);
        assert!(announcer.run_ids().is_empty());
    }

    #[tokio::test]
    async fn delete_cleanup_evicts_after_announce() {
        let (registry, _) = setup();
        registry.register(RegisterRun {
            run_id: "r-1".to_string(),
            child_session_key: "agent:main:subagent:a".to_string(),
            requester_session_key: "agent:main:main".to_string(),
            cleanup: CleanupPolicy::Delete,
            ..RegisterRun::default()
        });
        registry.handle_event(&end_event("r-1")).await;
        assert!(registry.get("r-1").is_none());
    }

    #[tokio::test]
    async fn sweep_evicts_only_expired_records() {
        let (registry, _) = setup();
        register(&registry, "done", "agent:main:subagent:a");
        register(&registry, "live", "agent:main:subagent:b");
        registry.handle_event(&end_event("done")).await;

        let archive_at = registry.get("done").unwrap().archive_at.unwrap();
        assert_eq!(registry.sweep_archived(archive_at - 1), 0);
        assert_eq!(registry.sweep_archived(archive_at), 1);
        assert!(registry.get("done").is_none());
        assert!(registry.get("live").is_some());
    }

    #[tokio::test]
    async fn background_sweeper_evicts_archived_runs() {
        let announcer = Arc::new(RecordingAnnouncer::default());
        let registry = Arc::new(SubagentRegistry::new(announcer, 0));
        register(&registry, "r-1", "agent:main:subagent:a");
        registry.handle_event(&end_event("r-1")).await;

        let sweeper = registry.spawn_archive_sweeper(Duration::from_millis(10));
        tokio::time::timeout(Duration::from_secs(2), async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sweeper should evict the archived run");
        sweeper.abort();
    }

    #[tokio::test]
    async fn reset_drops_everything() {
        let (registry, _) = setup();
        register(&registry, "r-1", "agent:main:subagent:a");
        assert_eq!(registry.len(), 1);
        registry.reset();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn requester_queries() {
        let (registry, _) = setup();
        register(&registry, "r-1", "agent:main:subagent:a");
        register(&registry, "r-2", "agent:main:subagent:b");
        registry.register(RegisterRun {
            run_id: "other".to_string(),
            child_session_key: "agent:ops:subagent:z".to_string(),
            requester_session_key: "agent:ops:main".to_string(),
            ..RegisterRun::default()
        });
        registry.handle_event(&end_event("r-1")).await;

        let runs = registry.list_for_requester("agent:main:main");
        assert_eq!(runs.len(), 2);
        assert_eq!(registry.count_active_for_requester("agent:main:main"), 1);
        assert_eq!(
            registry.active_run_ids_for_session("agent:main:subagent:b"),
            vec!["r-2"]
        );
    }

    #[tokio::test]
    async fn out_of_order_events_do_not_revive_or_reannounce() {
        let (registry, announcer) = setup();
        register(&registry, "r-1", "agent:main:subagent:a");
        registry.handle_event(&end_event("r-1")).await;

        // A late start must not move the ended run back to active.
        let late_start = LifecycleData {
            started_at: Some(7),
            ..LifecycleData::phase(LifecyclePhase::Start)
        };
        registry.handle_event(&AgentEvent::lifecycle("r-1", &late_start)).await;
        let run = registry.get("r-1").unwrap();
        assert_eq!(run.state, RunState::Terminated);
        assert!(!registry.is_session_run_active("agent:main:subagent:a"));

        // An error after end on a steer-pending run keeps the first result.
        register(&registry, "r-2", "agent:main:subagent:b");
        registry.mark_for_steer_restart("r-2");
        registry.handle_event(&end_event("r-2")).await;
        let late_error = LifecycleData {
            error: Some("socket closed".to_string()),
            ..LifecycleData::phase(LifecyclePhase::Error)
        };
        assert_eq!(
            registry.handle_event(&AgentEvent::lifecycle("r-2", &late_error)).await,
            None
        );
        assert_eq!(registry.get("r-2").unwrap().outcome, Some(RunOutcome::Ok));
        assert_eq!(registry.get("r-2").unwrap().state, RunState::SteerPending);

        assert!(registry.clear_steer_restart("r-2").await);
        assert_eq!(announcer.run_ids(), vec!["r-1", "r-2"]);
        assert_eq!(announcer.calls.lock()[1].outcome, RunOutcome::Ok);
    }

    #[tokio::test]
    async fn listener_keeps_every_terminal_event_of_a_burst() {
        let (registry, announcer) = setup();
        let bus = LifecycleBus::new();
        let _subscription = registry.listen(&bus);

        let total = 1_100;
        for n in 0..total {
            register(&registry, &format!("r-{n}"), &format!("agent:main:subagent:{n}"));
        }
        // Emitted before the listener task gets a chance to run.
        for n in 0..total {
            bus.emit(end_event(&format!("r-{n}")));
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while announcer.calls.lock().len() < total {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("every run should announce");
        assert_eq!(announcer.calls.lock().len(), total);
        assert_eq!(registry.count_active_for_requester("agent:main:main"), 0);
    }

    #[tokio::test]
    async fn slow_announce_does_not_stall_later_events() {
        struct GatedAnnouncer {
            gate: tokio::sync::Notify,
            calls: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl Announcer for GatedAnnouncer {
            async fn run_announce_flow(&self, request: AnnounceRequest) -> bool {
                self.calls.lock().push(request.child_run_id.clone());
                if request.child_run_id == "slow" {
                    self.gate.notified().await;
                }
                true
            }
        }

        let announcer = Arc::new(GatedAnnouncer {
            gate: tokio::sync::Notify::new(),
            calls: Mutex::new(Vec::new()),
        });
        let registry = Arc::new(SubagentRegistry::new(announcer.clone(), 60));
        let bus = LifecycleBus::new();
        let _subscription = registry.listen(&bus);
        register(&registry, "slow", "agent:main:subagent:a");
        register(&registry, "fast", "agent:main:subagent:b");

        bus.emit(end_event("slow"));
        bus.emit(end_event("fast"));

        tokio::time::timeout(Duration::from_secs(2), async {
            while announcer.calls.lock().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("second announce should not wait for the first");
        assert!(registry.get("fast").unwrap().cleanup_completed_at.is_some());
        assert!(registry.get("slow").unwrap().cleanup_completed_at.is_none());
        announcer.gate.notify_one();
    }

    #[tokio::test]
    async fn listener_processes_bus_events() {
        let (registry, announcer) = setup();
        let bus = LifecycleBus::new();
        let subscription = registry.listen(&bus);
        register(&registry, "r-1", "agent:main:subagent:a");

        bus.emit(AgentEvent::lifecycle("r-1", &LifecycleData::phase(LifecyclePhase::Start)));
        bus.emit(end_event("r-1"));

        tokio::time::timeout(Duration::from_secs(2), async {
            while announcer.run_ids().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("announce should arrive");
        assert!(subscription.is_active());
        subscription.unsubscribe();
    }
}
