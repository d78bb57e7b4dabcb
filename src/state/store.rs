//! Checkpoint persistence
//!
//! A checkpoint is the full `WorkflowState` of a thread after one step.
//! Backends: in-memory for development and tests, Postgres when a database
//! URL is configured.

use crate::error::WorkflowError;
use crate::state::WorkflowState;
use crate::workflow::NodeName;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub checkpoint_id: Uuid,
    pub thread_id: String,
    /// Node that produced this state; `None` for the initial checkpoint
    pub step: Option<NodeName>,
    pub state: WorkflowState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(step: Option<NodeName>, state: WorkflowState) -> Self {
        Self {
            checkpoint_id: Uuid::new_v4(),
            thread_id: state.context.thread_id.clone(),
            step,
            state,
            created_at: Utc::now(),
        }
    }
}

#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    /// All checkpoints of a thread, oldest first
    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>>;

    async fn delete_thread(&self, thread_id: &str) -> Result<()>;

    fn backend_name(&self) -> &'static str;
}

//
// ================= In-Memory =================
//

pub struct InMemoryCheckpointStore {
    threads: Arc<RwLock<HashMap<String, Vec<Checkpoint>>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            threads: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut threads = self.threads.write().await;
        threads
            .entry(checkpoint.thread_id.clone())
            .or_insert_with(Vec::new)
            .push(checkpoint.clone());
        Ok(())
    }

    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let threads = self.threads.read().await;
        Ok(threads.get(thread_id).and_then(|list| list.last().cloned()))
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let threads = self.threads.read().await;
        Ok(threads.get(thread_id).cloned().unwrap_or_default())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut threads = self.threads.write().await;
        threads.remove(thread_id);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "in-memory"
    }
}

//
// ================= Postgres =================
//

pub struct PostgresCheckpointStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        let pool = &self.pool;
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS workflow_checkpoints (
                      id BIGSERIAL PRIMARY KEY,
                      checkpoint_id UUID NOT NULL UNIQUE,
                      thread_id TEXT NOT NULL,
                      step TEXT,
                      state TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_workflow_checkpoints_thread
                    ON workflow_checkpoints (thread_id, id);
                    "#,
                )
                .execute(pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                WorkflowError::DatabaseError(format!(
                    "Failed to initialize checkpoint schema: {}",
                    e
                ))
            })?;

        Ok(())
    }

    fn row_to_checkpoint(row: &sqlx::postgres::PgRow) -> Result<Checkpoint> {
        let map_err =
            |e: sqlx::Error| WorkflowError::CheckpointError(format!("Malformed checkpoint row: {}", e));

        let step: Option<String> = row.try_get("step").map_err(map_err)?;
        let step = match step {
            Some(name) => Some(name.parse::<NodeName>()?),
            None => None,
        };
        let raw_state: String = row.try_get("state").map_err(map_err)?;

        Ok(Checkpoint {
            checkpoint_id: row.try_get("checkpoint_id").map_err(map_err)?,
            thread_id: row.try_get("thread_id").map_err(map_err)?,
            step,
            state: serde_json::from_str(&raw_state)?,
            created_at: row.try_get("created_at").map_err(map_err)?,
        })
    }
}

#[async_trait::async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.ensure_schema().await?;

        let state = serde_json::to_string(&checkpoint.state)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_checkpoints (checkpoint_id, thread_id, step, state, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(checkpoint.checkpoint_id)
        .bind(&checkpoint.thread_id)
        .bind(checkpoint.step.map(|s| s.as_str()))
        .bind(state)
        .bind(checkpoint.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| WorkflowError::DatabaseError(format!("Failed to save checkpoint: {}", e)))?;

        Ok(())
    }

    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT checkpoint_id, thread_id, step, state, created_at
            FROM workflow_checkpoints
            WHERE thread_id = $1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| WorkflowError::DatabaseError(format!("Failed to load checkpoint: {}", e)))?;

        row.as_ref().map(Self::row_to_checkpoint).transpose()
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT checkpoint_id, thread_id, step, state, created_at
            FROM workflow_checkpoints
            WHERE thread_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| WorkflowError::DatabaseError(format!("Failed to list checkpoints: {}", e)))?;

        rows.iter().map(Self::row_to_checkpoint).collect()
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query("DELETE FROM workflow_checkpoints WHERE thread_id = $1")
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                WorkflowError::DatabaseError(format!("Failed to delete checkpoints: {}", e))
            })?;

        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

/// Postgres when a URL is given and the pool can be created, in-memory otherwise.
pub fn build_checkpoint_store(database_url: Option<&str>) -> Arc<dyn CheckpointStore> {
    if let Some(url) = database_url {
        match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(url)
        {
            Ok(pool) => {
                info!("Checkpoint backend: postgres");
                return Arc::new(PostgresCheckpointStore::new(pool));
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres checkpoint backend, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Checkpoint backend: in-memory");
    Arc::new(InMemoryCheckpointStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserContext;

    fn state(thread: &str) -> WorkflowState {
        WorkflowState::new(thread, UserContext::new("u-1", "Alex"))
    }

    #[tokio::test]
    async fn test_latest_returns_most_recent() {
        let store = InMemoryCheckpointStore::new();
        let mut s = state("t-1");
        store.save(&Checkpoint::new(None, s.clone())).await.unwrap();

        s.enter_step(NodeName::ParseIntent);
        let second = Checkpoint::new(Some(NodeName::ParseIntent), s.clone());
        store.save(&second).await.unwrap();

        let latest = store.latest("t-1").await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, second.checkpoint_id);
        assert_eq!(latest.state, s);
        assert_eq!(store.list("t-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_threads_are_isolated() {
        let store = InMemoryCheckpointStore::new();
        store.save(&Checkpoint::new(None, state("a"))).await.unwrap();
        store.save(&Checkpoint::new(None, state("b"))).await.unwrap();

        store.delete_thread("a").await.unwrap();
        assert!(store.latest("a").await.unwrap().is_none());
        assert!(store.latest("b").await.unwrap().is_some());
    }

    #[test]
    fn test_checkpoint_json_round_trip() {
        let checkpoint = Checkpoint::new(Some(NodeName::Review), state("t-9"));
        let json = serde_json::to_string(&checkpoint).unwrap();
        let restored: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, checkpoint);
    }

    #[test]
    fn test_builds_in_memory_without_url() {
        let store = build_checkpoint_store(None);
        assert_eq!(store.backend_name(), "in-memory");
    }
}
