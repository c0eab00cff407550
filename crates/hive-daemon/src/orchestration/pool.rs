//! Semaphore-based spawn lane for global sub-agent concurrency control.
//!
//! The [`SpawnLane`] caps how many sub-agent runs execute at once across all
//! requesters (`maxConcurrent`). It issues permits via a Tokio semaphore and
//! tracks which run holds each slot, so a slot can follow a run through a
//! steer restart and be released when the run ends or is killed.

use std::collections::HashMap;
use std::sync::Arc;

use hive_core::config::DEFAULT_MAX_CONCURRENT;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// A permit granting the right to run one sub-agent.
///
/// When dropped, the permit is automatically returned to the lane.
pub struct LanePermit {
    _permit: OwnedSemaphorePermit,
}

/// A slot held by a running sub-agent.
struct LaneSlot {
    _permit: LanePermit,
    child_session_key: String,
}

/// Semaphore-based concurrency lane for sub-agent runs.
pub struct SpawnLane {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    /// Occupied slots keyed by run id.
    slots: Mutex<HashMap<String, LaneSlot>>,
}

impl SpawnLane {
    /// Create a new lane with the given concurrency limit (0 means default).
    pub fn new(max_concurrency: usize) -> Self {
        let limit = if max_concurrency == 0 {
            usize::try_from(DEFAULT_MAX_CONCURRENT).unwrap_or(1)
        } else {
            max_concurrency
        };

        info!(max_concurrency = limit, "SpawnLane created");

        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            max_concurrency: limit,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a permit without waiting. Returns `None` when the lane is full.
    pub fn try_acquire(&self) -> Option<LanePermit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(LanePermit { _permit: permit })
    }

    /// Attach a permit to a started run.
    pub fn occupy(&self, run_id: &str, permit: LanePermit, child_session_key: &str) {
        debug!(run_id, child_session_key, "Run occupies lane slot");
        self.slots.lock().insert(
            run_id.to_string(),
            LaneSlot {
                _permit: permit,
                child_session_key: child_session_key.to_string(),
            },
        );
    }

    /// Release the slot held by a run. Returns whether one was held.
    pub fn release(&self, run_id: &str) -> bool {
        let released = self.slots.lock().remove(run_id).is_some();
        if released {
            debug!(run_id, "Lane slot released");
        }
        released
    }

    /// Move a slot from an interrupted run to its successor.
    pub fn transfer(&self, from_run_id: &str, to_run_id: &str) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.remove(from_run_id) else {
            return false;
        };
        debug!(from_run_id, to_run_id, "Lane slot transferred");
        slots.insert(to_run_id.to_string(), slot);
        true
    }

    /// Run ids currently holding a slot for the given child session.
    pub fn runs_for_session(&self, child_session_key: &str) -> Vec<String> {
        self.slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.child_session_key == child_session_key)
            .map(|(run_id, _)| run_id.clone())
            .collect()
    }

    /// Run ids currently holding a slot.
    pub fn active_ids(&self) -> Vec<String> {
        self.slots.lock().keys().cloned().collect()
    }

    /// Number of occupied slots.
    pub fn active_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Maximum concurrency limit.
    pub const fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Number of available permits (slots) remaining.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for SpawnLane {
    fn default() -> Self {
        Self::new(0)
    }
}
