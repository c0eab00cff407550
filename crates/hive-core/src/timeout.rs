//! Effective run timeout resolution.
//!
//! Precedence: explicit override, then provider `timeoutMs`, then
//! `agents.defaults.timeoutSeconds`, then [`DEFAULT_TIMEOUT_SECONDS`]. The
//! result always lies in `[min_ms, MAX_SAFE_TIMEOUT_MS]`; the functions here
//! are total and never fail.

use crate::config::{Config, ProviderConfig};

/// Largest timeout handed to timers. Kept below `i32::MAX` milliseconds so
/// that it survives 32-bit timer APIs on the executor side.
pub const MAX_SAFE_TIMEOUT_MS: u64 = 2_147_000_000;

/// Agent timeout when `agents.defaults.timeoutSeconds` is unset.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 600;

/// Inputs for [`resolve_agent_timeout_ms`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutRequest<'a> {
    /// Explicit per-call override in milliseconds. `0` means "no timeout".
    pub override_ms: Option<f64>,
    /// Explicit override in seconds, consulted only when `override_ms` is `None`.
    pub override_seconds: Option<f64>,
    /// Provider whose `timeoutMs` should serve as the default.
    pub provider: Option<&'a str>,
    /// Lower bound of the result (default 1).
    pub min_ms: Option<u64>,
}

/// Default provider id normalization: trimmed and lower-cased.
pub fn normalize_provider_id(provider: &str) -> String {
    provider.trim().to_ascii_lowercase()
}

/// Agent default timeout in whole seconds (at least 1).
pub fn resolve_agent_timeout_seconds(config: &Config) -> u64 {
    config
        .agents
        .defaults
        .timeout_seconds
        .filter(|secs| secs.is_finite())
        .map_or(DEFAULT_TIMEOUT_SECONDS, |secs| floor_to_u64(secs).max(1))
}

/// Resolve the effective timeout with [`normalize_provider_id`] as the
/// provider-key fallback.
pub fn resolve_agent_timeout_ms(config: &Config, request: &TimeoutRequest<'_>) -> u64 {
    resolve_agent_timeout_ms_with(config, request, normalize_provider_id)
}

/// Resolve the effective timeout with an injected provider-id normalizer.
///
/// Provider lookup tries the exact key first, then any configured key whose
/// normalized form equals the normalized request.
pub fn resolve_agent_timeout_ms_with<F>(
    config: &Config,
    request: &TimeoutRequest<'_>,
    normalize: F,
) -> u64
where
    F: Fn(&str) -> String,
{
    let min_ms = request.min_ms.unwrap_or(1).clamp(1, MAX_SAFE_TIMEOUT_MS);
    let clamp = |ms: u64| ms.max(1).clamp(min_ms, MAX_SAFE_TIMEOUT_MS);

    let provider_ms = request
        .provider
        .and_then(|name| lookup_provider(config, name, &normalize))
        .and_then(ProviderConfig::effective_timeout_ms)
        .filter(|ms| ms.is_finite());

    let default_ms = clamp(provider_ms.map_or_else(
        || resolve_agent_timeout_seconds(config).saturating_mul(1000),
        floor_to_u64,
    ));

    let override_ms = request
        .override_ms
        .or_else(|| request.override_seconds.map(|secs| secs * 1000.0));

    match override_ms {
        None => default_ms,
        Some(ms) if !ms.is_finite() || ms < 0.0 => default_ms,
        Some(ms) if ms == 0.0 => MAX_SAFE_TIMEOUT_MS,
        Some(ms) => clamp(floor_to_u64(ms)),
    }
}

fn lookup_provider<'c, F>(config: &'c Config, name: &str, normalize: &F) -> Option<&'c ProviderConfig>
where
    F: Fn(&str) -> String,
{
    let providers = &config.models.providers;
    providers.get(name).or_else(|| {
        let wanted = normalize(name);
        providers
            .iter()
            .find(|(key, _)| normalize(key) == wanted)
            .map(|(_, provider)| provider)
    })
}

/// Floor a non-negative finite value into `u64`, saturating at the top.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn floor_to_u64(value: f64) -> u64 {
    if value <= 0.0 {
        0
    } else if value >= u64::MAX as f64 {
        u64::MAX
    } else {
        value.floor() as u64
    }
}
