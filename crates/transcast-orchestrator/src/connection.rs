//! Connection manager: owns per-agent outbound channels and the observer
//! fan-out list, and implements `transcast_core::scheduler::Dispatch` so the
//! scheduler can push assignments without knowing about WebSockets at all.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration};
use tracing::{info, warn};
use transcast_core::message::{ObserverFrame, OrchestratorFrame};
use transcast_core::registry::AgentRegistry;
use transcast_core::scheduler::{Dispatch, Scheduler};
use transcast_db::models::Task;
use transcast_db::queries::tasks;

use crate::store::PgTaskStore;

const HEARTBEAT_TIMEOUT: chrono::Duration = chrono::Duration::seconds(90);
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

type AgentSender = tokio::sync::mpsc::UnboundedSender<OrchestratorFrame>;
type ObserverSender = tokio::sync::mpsc::UnboundedSender<ObserverFrame>;

pub struct ConnectionManager {
    agents: Mutex<HashMap<String, AgentSender>>,
    observers: Mutex<Vec<ObserverSender>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub async fn register_agent(&self, agent_id: &str, sender: AgentSender) {
        self.agents.lock().await.insert(agent_id.to_string(), sender);
    }

    pub async fn remove_agent(&self, agent_id: &str) {
        self.agents.lock().await.remove(agent_id);
    }

    pub async fn register_observer(&self, sender: ObserverSender) {
        self.observers.lock().await.push(sender);
    }

    /// Fan out to every observer; dead ones are dropped on send failure
    /// without affecting delivery to the rest.
    pub async fn broadcast_observers(&self, frame: ObserverFrame) {
        let mut observers = self.observers.lock().await;
        observers.retain(|tx| tx.send(frame.clone()).is_ok());
    }

    /// Runs until the process exits: every `SWEEP_INTERVAL`, fail any agent
    /// whose heartbeat is stale, fail its in-flight task, and wake the
    /// scheduler.
    pub async fn run_heartbeat_sweep(
        self: Arc<Self>,
        pool: PgPool,
        registry: Arc<AgentRegistry>,
        scheduler: Arc<Scheduler<PgTaskStore, ConnectionManager>>,
    ) {
        let mut ticker = interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;

            let stale = registry.timed_out(Utc::now(), HEARTBEAT_TIMEOUT).await;
            for agent_id in stale {
                registry.mark_error(&agent_id).await;
                warn!(agent_id = %agent_id, "heartbeat timeout, marking offline");
                self.remove_agent(&agent_id).await;
                let Some(task_id) = registry.mark_offline(&agent_id).await else {
                    continue;
                };

                match tasks::fail(&pool, task_id, "agent lost").await {
                    Ok(Some(task)) => {
                        self.broadcast_assignment(&task, &registry).await;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(task_id = %task_id, error = %e, "failed to fail dangling task"),
                }

                if let Err(e) = scheduler.try_assign().await {
                    warn!(error = %e, "try_assign failed after heartbeat timeout");
                }
            }
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatch for ConnectionManager {
    async fn send_to(&self, agent_id: &str, frame: OrchestratorFrame) -> bool {
        let agents = self.agents.lock().await;
        match agents.get(agent_id) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    async fn broadcast_assignment(&self, task: &Task, registry: &AgentRegistry) {
        self.broadcast_observers(ObserverFrame::TaskUpdate { task: task.clone() }).await;

        let snapshot = registry.snapshot().await;
        let agents_json = serde_json::to_value(&snapshot).unwrap_or_else(|e| {
            warn!(error = %e, "failed to serialize agent registry snapshot");
            serde_json::json!({})
        });
        self.broadcast_observers(ObserverFrame::AgentsUpdate { agents: agents_json }).await;
    }
}

/// Log a one-line summary on every agent connect/disconnect; kept separate
/// from the hot routing path so the WebSocket handler stays readable.
pub fn log_agent_connected(agent_id: &str) {
    info!(agent_id, "agent connected");
}
