//! Configuration resolution for Hive.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/hive/settings.json)
//! 3. Project config (.hive/settings.json)
//! 4. Environment variables
//!
//! Parsed fields stay optional so that "unset" is distinguishable from an
//! explicit value; [`SubagentLimits::resolve`] turns them into a fully
//! populated struct.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::session_key::normalize_agent_id;

/// Default maximum nesting depth for spawned sub-agents.
pub const DEFAULT_MAX_SPAWN_DEPTH: u32 = 2;

/// Default number of sub-agent runs executing at once across all requesters.
pub const DEFAULT_MAX_CONCURRENT: u32 = 8;

/// Default retention of completed runs kept for inspection.
pub const DEFAULT_ARCHIVE_AFTER_MINUTES: u64 = 60;

/// Complete Hive configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub models: ModelsConfig,
}

/// `agents` section: shared defaults plus per-agent entries.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    #[serde(default)]
    pub defaults: AgentDefaults,
    #[serde(default)]
    pub list: Vec<AgentEntry>,
}

/// `agents.defaults`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefaults {
    /// Run timeout in seconds applied when no provider timeout is configured.
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub subagents: SubagentDefaults,
}

/// `agents.defaults.subagents`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubagentDefaults {
    pub max_spawn_depth: Option<u32>,
    pub max_concurrent: Option<u32>,
    pub max_children_per_agent: Option<u32>,
    pub archive_after_minutes: Option<u64>,
}

/// One entry of `agents.list`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentEntry {
    pub id: String,
    #[serde(default)]
    pub subagents: AgentSubagentOverrides,
}

/// Per-agent sub-agent overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentSubagentOverrides {
    pub max_spawn_depth: Option<u32>,
}

/// `models` section.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModelsConfig {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

/// `models.providers.<name>`. Unknown provider fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Request timeout in milliseconds.
    pub timeout_ms: Option<f64>,
    /// Deprecated alias of `timeoutMs` (milliseconds). Ignored when
    /// `timeoutMs` is present.
    pub timeout: Option<f64>,
}

impl ProviderConfig {
    /// Effective provider timeout: `timeoutMs`, else the deprecated `timeout`.
    pub fn effective_timeout_ms(&self) -> Option<f64> {
        self.timeout_ms.or(self.timeout)
    }
}

/// A non-fatal configuration problem worth surfacing to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    /// Dotted path of the offending field.
    pub path: String,
    pub message: String,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl Config {
    /// Collect configuration warnings. Warnings never affect resolution.
    pub fn warnings(&self) -> Vec<ConfigWarning> {
        self.models
            .providers
            .iter()
            .filter(|(_, provider)| provider.timeout.is_some() && provider.timeout_ms.is_some())
            .map(|(name, _)| ConfigWarning {
                path: format!("models.providers.{name}.timeout"),
                message: "deprecated `timeout` is ignored because `timeoutMs` is set".to_string(),
            })
            .collect()
    }

    /// Look up an agent entry by (normalized) id.
    pub fn agent(&self, agent_id: &str) -> Option<&AgentEntry> {
        let wanted = normalize_agent_id(agent_id);
        self.agents
            .list
            .iter()
            .find(|entry| normalize_agent_id(&entry.id) == wanted)
    }
}

/// Fully resolved sub-agent limits for one requesting agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubagentLimits {
    pub max_spawn_depth: u32,
    /// `None` means no per-requester concurrency cap.
    pub max_children_per_agent: Option<u32>,
    pub max_concurrent: u32,
    pub archive_after_minutes: u64,
}

impl SubagentLimits {
    /// Resolve limits for `requester_agent_id`.
    ///
    /// Depth precedence: `agents.defaults.subagents.maxSpawnDepth`, then the
    /// requesting agent's own override, then [`DEFAULT_MAX_SPAWN_DEPTH`].
    pub fn resolve(config: &Config, requester_agent_id: &str) -> Self {
        let defaults = &config.agents.defaults.subagents;
        let max_spawn_depth = defaults
            .max_spawn_depth
            .or_else(|| {
                config
                    .agent(requester_agent_id)
                    .and_then(|entry| entry.subagents.max_spawn_depth)
            })
            .unwrap_or(DEFAULT_MAX_SPAWN_DEPTH);

        Self {
            max_spawn_depth,
            max_children_per_agent: defaults.max_children_per_agent,
            max_concurrent: defaults
                .max_concurrent
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_CONCURRENT),
            archive_after_minutes: defaults
                .archive_after_minutes
                .unwrap_or(DEFAULT_ARCHIVE_AFTER_MINUTES),
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    // Load global config
    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    // Load project config
    if let Some(dir) = project_dir {
        let project_path = dir.join(".hive").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config);

    for warning in config.warnings() {
        warn!(path = %warning.path, "{}", warning.message);
    }

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".hive").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/hive/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("hive").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Get the session store path for the daemon.
pub fn database_path() -> Option<PathBuf> {
    global_config_path().and_then(|p| p.parent().map(|dir| dir.join("sessions.db")))
}

pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    let defaults = overlay.agents.defaults;
    if defaults.timeout_seconds.is_some() {
        base.agents.defaults.timeout_seconds = defaults.timeout_seconds;
    }

    let sub = defaults.subagents;
    let base_sub = &mut base.agents.defaults.subagents;
    if sub.max_spawn_depth.is_some() {
        base_sub.max_spawn_depth = sub.max_spawn_depth;
    }
    if sub.max_concurrent.is_some() {
        base_sub.max_concurrent = sub.max_concurrent;
    }
    if sub.max_children_per_agent.is_some() {
        base_sub.max_children_per_agent = sub.max_children_per_agent;
    }
    if sub.archive_after_minutes.is_some() {
        base_sub.archive_after_minutes = sub.archive_after_minutes;
    }

    // Agent entries replace same-id entries, new ids are appended.
    for entry in overlay.agents.list {
        let id = normalize_agent_id(&entry.id);
        if let Some(existing) = base
            .agents
            .list
            .iter_mut()
            .find(|e| normalize_agent_id(&e.id) == id)
        {
            *existing = entry;
        } else {
            base.agents.list.push(entry);
        }
    }

    base.models.providers.extend(overlay.models.providers);
}

fn apply_env_overrides(config: &mut Config) {
    let sub = &mut config.agents.defaults.subagents;
    if let Some(n) = env_parse("HIVE_MAX_SPAWN_DEPTH") {
        sub.max_spawn_depth = Some(n);
    }
    if let Some(n) = env_parse("HIVE_MAX_CHILDREN_PER_AGENT") {
        sub.max_children_per_agent = Some(n);
    }
    if let Some(n) = env_parse("HIVE_MAX_CONCURRENT") {
        sub.max_concurrent = Some(n);
    }
    if let Some(secs) = env_parse("HIVE_TIMEOUT_SECONDS") {
        config.agents.defaults.timeout_seconds = Some(secs);
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|val| val.trim().parse().ok())
}
