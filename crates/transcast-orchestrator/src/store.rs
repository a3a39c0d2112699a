//! Postgres-backed [`TaskStore`] adapter, wrapping `transcast_db::queries::tasks`.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use transcast_core::scheduler::TaskStore;
use transcast_db::models::Task;
use transcast_db::queries::tasks;
use uuid::Uuid;

pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn next_pending(&self) -> Result<Option<Task>> {
        tasks::next_pending(&self.pool).await
    }

    async fn assign(&self, id: Uuid, agent_id: &str) -> Result<Option<Task>> {
        tasks::assign(&self.pool, id, agent_id).await
    }

    async fn reset_to_pending(&self, id: Uuid) -> Result<Option<Task>> {
        tasks::reset_to_pending(&self.pool, id).await
    }
}
