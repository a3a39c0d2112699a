//! Shared orchestrator state, threaded through axum's `State` extractor
//! rather than reached for as an implicit singleton.

use std::sync::Arc;

use sqlx::PgPool;
use transcast_core::registry::AgentRegistry;
use transcast_core::scheduler::Scheduler;

use crate::connection::ConnectionManager;
use crate::store::PgTaskStore;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub registry: Arc<AgentRegistry>,
    pub connections: Arc<ConnectionManager>,
    pub scheduler: Arc<Scheduler<PgTaskStore, ConnectionManager>>,
}

impl AppState {
    pub fn new(pool: PgPool) -> Self {
        let registry = Arc::new(AgentRegistry::new());
        let connections = Arc::new(ConnectionManager::new());
        let store = Arc::new(PgTaskStore::new(pool.clone()));
        let scheduler = Arc::new(Scheduler::new(store, registry.clone(), connections.clone()));

        Self {
            pool,
            registry,
            connections,
            scheduler,
        }
    }
}
