//! `Hive` Daemon Library
//!
//! Core functionality for the `Hive` sub-agent control plane:
//! - Run registry with the steer-restart protocol and announce bookkeeping
//! - Depth and concurrency admission control for spawn requests
//! - Spawn manager driving the external run executor
//! - `SQLite` session store for persisted spawn depth

pub mod orchestration;
pub mod storage;
