//! Session key model.
//!
//! A session key is a colon-delimited path such as
//! `agent:main:subagent:3f2a:subagent:91bc`. The first two segments name the
//! owning agent; every `subagent:<id>` pair after that adds one nesting level.
//! Everything here is pure: no I/O, no shared state.

/// Leading segment of every agent session key.
const AGENT_PREFIX: &str = "agent";

/// Marker segment introducing one level of sub-agent nesting.
const SUBAGENT_MARKER: &str = "subagent";

/// Agent id used when a key does not name one.
pub const DEFAULT_AGENT_ID: &str = "main";

/// The two halves of a recognized agent session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSessionKey {
    /// Normalized (lower-cased) agent id.
    pub agent_id: String,
    /// Everything after `agent:<agentId>:`.
    pub rest: String,
}

/// Parse an `agent:<agentId>:<rest>` key.
///
/// Returns `None` for anything that is not a recognized agent session key:
/// empty input, fewer than three segments, a different prefix, or an empty
/// agent id / remainder. Callers treat `None` as depth 0.
pub fn parse_agent_session_key(session_key: &str) -> Option<ParsedSessionKey> {
    let raw = session_key.trim();
    if raw.is_empty() {
        return None;
    }

    let mut parts = raw.splitn(3, ':');
    let prefix = parts.next()?;
    let agent_id = parts.next()?.trim();
    let rest = parts.next()?.trim();

    if !prefix.eq_ignore_ascii_case(AGENT_PREFIX) || agent_id.is_empty() || rest.is_empty() {
        return None;
    }

    Some(ParsedSessionKey {
        agent_id: normalize_agent_id(agent_id),
        rest: rest.to_string(),
    })
}

/// Count the `subagent:<id>` levels of a session key.
///
/// Bare or unrecognized keys have depth 0.
pub fn subagent_depth(session_key: &str) -> u32 {
    parse_agent_session_key(session_key).map_or(0, |parsed| count_markers(&parsed.rest))
}

/// Whether the key belongs to a spawned sub-agent session.
pub fn is_subagent_session_key(session_key: &str) -> bool {
    subagent_depth(session_key) > 0
}

/// Resolve the spawn depth of a session from both depth sources.
///
/// A stored `spawnDepth` wins when it is a non-negative integer that fits
/// `u32`; otherwise the depth is counted from the key itself.
pub fn resolve_spawn_depth(session_key: &str, stored_depth: Option<i64>) -> u32 {
    stored_depth
        .and_then(|depth| u32::try_from(depth).ok())
        .unwrap_or_else(|| subagent_depth(session_key))
}

/// Agent id that owns a session key, falling back to [`DEFAULT_AGENT_ID`].
pub fn resolve_agent_id(session_key: &str) -> String {
    parse_agent_session_key(session_key)
        .map_or_else(|| DEFAULT_AGENT_ID.to_string(), |parsed| parsed.agent_id)
}

/// Lower-case and trim an agent id; an empty id becomes [`DEFAULT_AGENT_ID`].
pub fn normalize_agent_id(agent_id: &str) -> String {
    let trimmed = agent_id.trim();
    if trimmed.is_empty() {
        DEFAULT_AGENT_ID.to_string()
    } else {
        trimmed.to_ascii_lowercase()
    }
}

/// Derive the session key for a child spawned by `requester_key`.
///
/// The child inherits the requester's `subagent:` path and appends one more
/// level, so `subagent_depth(child) == subagent_depth(requester) + 1`.
pub fn derive_child_session_key(requester_key: &str, target_agent_id: &str, child_id: &str) -> String {
    let agent_id = normalize_agent_id(target_agent_id);
    let inherited = parse_agent_session_key(requester_key)
        .and_then(|parsed| subagent_path(&parsed.rest).map(str::to_string));

    match inherited {
        Some(path) => format!("{AGENT_PREFIX}:{agent_id}:{path}:{SUBAGENT_MARKER}:{child_id}"),
        None => format!("{AGENT_PREFIX}:{agent_id}:{SUBAGENT_MARKER}:{child_id}"),
    }
}

/// Number of `subagent` markers that are followed by a non-empty id.
fn count_markers(rest: &str) -> u32 {
    let segments: Vec<&str> = rest.split(':').collect();
    let mut depth = 0;
    let mut i = 0;
    while i < segments.len() {
        let is_marker = segments[i].eq_ignore_ascii_case(SUBAGENT_MARKER);
        let has_id = segments.get(i + 1).is_some_and(|id| !id.is_empty());
        if is_marker && has_id {
            depth += 1;
            i += 2;
        } else {
            i += 1;
        }
    }
    depth
}

/// The suffix of `rest` starting at its first `subagent` marker, if any.
fn subagent_path(rest: &str) -> Option<&str> {
    if count_markers(rest) == 0 {
        return None;
    }
    let mut offset = 0;
    for segment in rest.split(':') {
        if segment.eq_ignore_ascii_case(SUBAGENT_MARKER) {
            return Some(&rest[offset..]);
        }
        offset += segment.len() + 1;
    }
    None
}
