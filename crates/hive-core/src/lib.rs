//! `Hive` Core Library
//!
//! Shared functionality for `Hive` components:
//! - Session key parsing and spawn-depth derivation
//! - Layered timeout resolution for sub-agent runs
//! - Configuration model and hierarchical loading
//! - Common error types and `SQLite` helpers

pub mod config;
pub mod db;
pub mod error;
pub mod session_key;
pub mod timeout;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use session_key::{ParsedSessionKey, parse_agent_session_key, subagent_depth};
pub use timeout::{MAX_SAFE_TIMEOUT_MS, TimeoutRequest, resolve_agent_timeout_ms};
