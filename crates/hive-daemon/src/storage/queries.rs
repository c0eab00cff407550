//! Database queries for the session store.

use hive_core::db::unix_timestamp;
use hive_core::session_key::resolve_spawn_depth;

use super::db::{Database, DatabaseError};
use super::models::SessionRow;

impl Database {
    /// Record (or refresh) a spawned session and its depth.
    pub async fn record_spawned_session(
        &self,
        session_key: &str,
        agent_id: &str,
        spawn_depth: u32,
        spawned_by: Option<&str>,
    ) -> Result<SessionRow, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO sessions (session_key, agent_id, spawn_depth, spawned_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_key) DO UPDATE SET
                agent_id = excluded.agent_id,
                spawn_depth = excluded.spawn_depth,
                spawned_by = excluded.spawned_by,
                updated_at = excluded.updated_at
            ",
        )
        .bind(session_key)
        .bind(agent_id)
        .bind(i64::from(spawn_depth))
        .bind(spawned_by)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_session(session_key).await
    }

    /// Get a session by key.
    pub async fn get_session(&self, session_key: &str) -> Result<SessionRow, DatabaseError> {
        sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE session_key = ?")
            .bind(session_key)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Session {session_key}")))
    }

    /// Raw stored depth for a session, `None` when the row or value is absent.
    pub async fn get_spawn_depth(&self, session_key: &str) -> Result<Option<i64>, DatabaseError> {
        let depth: Option<Option<i64>> =
            sqlx::query_scalar("SELECT spawn_depth FROM sessions WHERE session_key = ?")
                .bind(session_key)
                .fetch_optional(self.pool())
                .await?;
        Ok(depth.flatten())
    }

    /// Effective depth of a session: stored depth when valid, otherwise the
    /// depth counted from the key. Store failures also fall back to counting.
    pub async fn resolve_session_depth(&self, session_key: &str) -> u32 {
        let stored = match self.get_spawn_depth(session_key).await {
            Ok(depth) => depth,
            Err(e) => {
                tracing::warn!(session_key, error = %e, "Session store lookup failed, counting key segments");
                None
            }
        };
        resolve_spawn_depth(session_key, stored)
    }

    /// Sessions spawned by the given requester, oldest first.
    pub async fn list_children(&self, spawned_by: &str) -> Result<Vec<SessionRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions WHERE spawned_by = ? ORDER BY created_at ASC, session_key ASC",
        )
        .bind(spawned_by)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Delete a session row. Returns whether a row was removed.
    pub async fn delete_session(&self, session_key: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM sessions WHERE session_key = ?")
            .bind(session_key)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_and_read_back() {
        let db = Database::open_in_memory().await.unwrap();
        let row = db
            .record_spawned_session("agent:main:subagent:a", "main", 1, Some("agent:main:main"))
            .await
            .unwrap();
        assert_eq!(row.spawn_depth, Some(1));
        assert_eq!(row.spawned_by.as_deref(), Some("agent:main:main"));
        assert_eq!(db.get_spawn_depth("agent:main:subagent:a").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn missing_session_has_no_depth() {
        let db = Database::open_in_memory().await.unwrap();
        assert_eq!(db.get_spawn_depth("agent:main:nope").await.unwrap(), None);
        assert!(matches!(
            db.get_session("agent:main:nope").await,
            Err(DatabaseError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stored_depth_overrides_counted_depth() {
        let db = Database::open_in_memory().await.unwrap();
        db.record_spawned_session("agent:main:subagent:flat", "main", 3, None)
            .await
            .unwrap();
        assert_eq!(db.resolve_session_depth("agent:main:subagent:flat").await, 3);
        assert_eq!(db.resolve_session_depth("agent:main:subagent:x:subagent:y").await, 2);
    }

    #[tokio::test]
    async fn invalid_stored_depth_is_ignored() {
        let db = Database::open_in_memory().await.unwrap();
        db.record_spawned_session("agent:main:subagent:a", "main", 1, None)
            .await
            .unwrap();
        sqlx::query("UPDATE sessions SET spawn_depth = -4 WHERE session_key = ?")
            .bind("agent:main:subagent:a")
            .execute(db.pool())
            .await
            .unwrap();
        assert_eq!(db.resolve_session_depth("agent:main:subagent:a").await, 1);
    }

    #[tokio::test]
    async fn upsert_refreshes_depth() {
        let db = Database::open_in_memory().await.unwrap();
        db.record_spawned_session("agent:main:subagent:a", "main", 1, None)
            .await
            .unwrap();
        db.record_spawned_session("agent:main:subagent:a", "main", 2, Some("agent:main:main"))
            .await
            .unwrap();
        assert_eq!(db.get_spawn_depth("agent:main:subagent:a").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn list_and_delete_children() {
        let db = Database::open_in_memory().await.unwrap();
        db.record_spawned_session("agent:main:subagent:a", "main", 1, Some("agent:main:main"))
            .await
            .unwrap();
        db.record_spawned_session("agent:main:subagent:b", "main", 1, Some("agent:main:main"))
            .await
            .unwrap();
        db.record_spawned_session("agent:main:subagent:c", "main", 1, Some("agent:ops:main"))
            .await
            .unwrap();

        let children = db.list_children("agent:main:main").await.unwrap();
        assert_eq!(children.len(), 2);

        assert!(db.delete_session("agent:main:subagent:a").await.unwrap());
        assert!(!db.delete_session("agent:main:subagent:a").await.unwrap());
        assert_eq!(db.list_children("agent:main:main").await.unwrap().len(), 1);
    }
}
