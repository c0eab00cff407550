//! `Hive` Daemon
//!
//! Operator entry point: inspects the resolved sub-agent limits, spawn depth
//! of stored sessions, and effective run timeouts.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing::info;

use hive_core::config::{SubagentLimits, database_path, load_config};
use hive_core::session_key::resolve_agent_id;
use hive_core::timeout::{TimeoutRequest, resolve_agent_timeout_ms, resolve_agent_timeout_seconds};
use hive_daemon::storage::Database;

#[derive(Parser, Debug)]
#[command(name = "hive-daemon")]
#[command(version, about = "Hive daemon - sub-agent orchestration control plane")]
struct Args {
    /// Project directory whose `.hive/settings.json` is layered over the global config
    #[arg(long, env = "HIVE_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Session store file path
    #[arg(long, env = "HIVE_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "warn", env = "HIVE_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "HIVE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the resolved sub-agent limits and configuration warnings.
    Limits {
        /// Requesting agent id
        #[arg(long, default_value = "main")]
        agent: String,
    },
    /// Resolve the spawn depth of a session key.
    Depth {
        session_key: String,
    },
    /// Resolve the effective run timeout.
    Timeout {
        /// Provider whose `timeoutMs` serves as the default
        #[arg(long)]
        provider: Option<String>,
        /// Override in milliseconds (0 = no timeout)
        #[arg(long, conflicts_with = "override_seconds", allow_negative_numbers = true)]
        override_ms: Option<f64>,
        /// Override in seconds (0 = no timeout)
        #[arg(long, allow_negative_numbers = true)]
        override_seconds: Option<f64>,
        /// Lower bound in milliseconds
        #[arg(long)]
        min_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("hive_daemon={0},hive_core={0}", args.log_level);
    hive_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let config = load_config(args.project_dir.as_deref()).context("Failed to load configuration")?;

    match args.command {
        Command::Limits { agent } => {
            let limits = SubagentLimits::resolve(&config, &agent);
            print_limits(&agent, &limits, resolve_agent_timeout_seconds(&config));
            print_warnings(&config.warnings());
        }
        Command::Depth { session_key } => {
            let path = match args.db_path {
                Some(path) => path,
                None => database_path().context("Cannot determine session store path")?,
            };
            info!(path = %path.display(), "Opening session store");
            let db = Database::open(&path).await?;
            let depth = db.resolve_session_depth(&session_key).await;
            print_depth(&session_key, &resolve_agent_id(&session_key), depth);
        }
        Command::Timeout {
            provider,
            override_ms,
            override_seconds,
            min_ms,
        } => {
            let request = TimeoutRequest {
                override_ms,
                override_seconds,
                provider: provider.as_deref(),
                min_ms,
            };
            print_timeout(resolve_agent_timeout_ms(&config, &request));
        }
    }

    Ok(())
}

#[allow(clippy::print_stdout)]
fn print_limits(agent: &str, limits: &SubagentLimits, timeout_seconds: u64) {
    println!("agent:                  {agent}");
    println!("maxSpawnDepth:          {}", limits.max_spawn_depth);
    match limits.max_children_per_agent {
        Some(max) => println!("maxChildrenPerAgent:    {max}"),
        None => println!("maxChildrenPerAgent:    unlimited"),
    }
    println!("maxConcurrent:          {}", limits.max_concurrent);
    println!("archiveAfterMinutes:    {}", limits.archive_after_minutes);
    println!("timeoutSeconds:         {timeout_seconds}");
}

#[allow(clippy::print_stdout)]
fn print_warnings(warnings: &[hive_core::config::ConfigWarning]) {
    for warning in warnings {
        println!("warning: {warning}");
    }
}

#[allow(clippy::print_stdout)]
fn print_depth(session_key: &str, agent_id: &str, depth: u32) {
    println!("{session_key}  agent={agent_id}  depth={depth}");
}

#[allow(clippy::print_stdout)]
fn print_timeout(timeout_ms: u64) {
    println!("{timeout_ms}");
}
