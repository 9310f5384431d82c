use std::collections::HashMap;

use parking_lot::Mutex;
use sqlx::PgPool;
use uuid::Uuid;

use super::buffer::TrajectoryBuffer;
use crate::error::AgentError;

/// Session-scoped persistence for trajectory buffers.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// The session's buffer, or an empty one if nothing is stored.
    async fn load(&self, session: Uuid) -> Result<TrajectoryBuffer, AgentError>;
    async fn save(&self, session: Uuid, buffer: &TrajectoryBuffer) -> Result<(), AgentError>;
    async fn clear(&self, session: Uuid) -> Result<(), AgentError>;
}

/// Process-local store. Sessions vanish on restart.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    buffers: Mutex<HashMap<Uuid, TrajectoryBuffer>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.buffers.lock().len()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session: Uuid) -> Result<TrajectoryBuffer, AgentError> {
        Ok(self.buffers.lock().get(&session).cloned().unwrap_or_default())
    }

    async fn save(&self, session: Uuid, buffer: &TrajectoryBuffer) -> Result<(), AgentError> {
        self.buffers.lock().insert(session, buffer.clone());
        Ok(())
    }

    async fn clear(&self, session: Uuid) -> Result<(), AgentError> {
        self.buffers.lock().remove(&session);
        Ok(())
    }
}

fn encode_buffer(buffer: &TrajectoryBuffer) -> Result<serde_json::Value, AgentError> {
    serde_json::to_value(buffer).map_err(|e| AgentError::SessionFormat(e.to_string()))
}

fn decode_buffer(value: serde_json::Value) -> Result<TrajectoryBuffer, AgentError> {
    serde_json::from_value(value).map_err(|e| AgentError::SessionFormat(e.to_string()))
}

/// `session_trajectory` table, one JSONB row per session.
#[derive(Debug, Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SessionStore for PgSessionStore {
    async fn load(&self, session: Uuid) -> Result<TrajectoryBuffer, AgentError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT buffer FROM session_trajectory WHERE session_id = $1")
                .bind(session)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((value,)) => decode_buffer(value),
            None => Ok(TrajectoryBuffer::new()),
        }
    }

    async fn save(&self, session: Uuid, buffer: &TrajectoryBuffer) -> Result<(), AgentError> {
        let value = encode_buffer(buffer)?;
        sqlx::query(
            "INSERT INTO session_trajectory (session_id, buffer, updated_at) VALUES ($1, $2, NOW()) \
             ON CONFLICT (session_id) DO UPDATE SET buffer = EXCLUDED.buffer, updated_at = NOW()",
        )
        .bind(session)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear(&self, session: Uuid) -> Result<(), AgentError> {
        sqlx::query("DELETE FROM session_trajectory WHERE session_id = $1")
            .bind(session)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
