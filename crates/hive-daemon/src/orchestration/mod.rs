//! Sub-agent orchestration: run registry, admission, steer restarts and spawning.
//!
//! This module is the control plane for spawned sub-agent runs:
//!
//! - [`SubagentRegistry`]: Authoritative store of run records and their
//!   lifecycle state machine, including the steer-restart protocol.
//! - [`AdmissionController`]: Depth and per-requester limits for new spawns.
//! - [`SpawnLane`]: Semaphore-based global limit on concurrently running sub-agents.
//! - [`SubagentManager`]: High-level coordinator that spawns, watches, steers
//!   and kills sub-agent runs.
//! - [`LifecycleBus`]: Event bridge the executor publishes lifecycle events on.
//! - [`RunExecutor`] and [`Announcer`]: Contracts of the external execution
//!   engine and completion delivery.

pub mod admission;
pub mod announce;
pub mod executor;
pub mod lifecycle;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod types;

pub use admission::{AdmissionController, AdmissionDecision, AdmissionDenied};
pub use announce::{AnnounceRequest, Announcer};
pub use executor::{ExecutorError, RunExecutor, RunSpec, WaitResult, WaitStatus};
pub use lifecycle::{AgentEvent, LifecycleBus, LifecycleData, LifecyclePhase, Subscription};
pub use manager::{ManagerError, SpawnAccepted, SpawnRequest, SubagentManager};
pub use pool::SpawnLane;
pub use registry::SubagentRegistry;
pub use types::{
    CleanupPolicy, DeliveryContext, RegisterRun, ReplaceRun, RunCompletion, RunOutcome, RunState,
    SubagentRun,
};
