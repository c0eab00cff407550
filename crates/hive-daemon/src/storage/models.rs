//! Database models for the session store.

use serde::{Deserialize, Serialize};

/// Session record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionRow {
    pub session_key: String,
    pub agent_id: String,
    /// Depth recorded at spawn time. May be missing or invalid for rows
    /// written by older versions or edited by hand.
    pub spawn_depth: Option<i64>,
    /// Session key of the requester that spawned this session.
    pub spawned_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}
