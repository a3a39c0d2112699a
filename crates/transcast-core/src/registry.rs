//! In-memory agent registry.
//!
//! Keyed by `agent_id`. Guarded by a single `tokio::sync::Mutex` --
//! registry operations are synchronous and never perform I/O, so a mutex
//! (rather than a message-passing actor) is sufficient to serialize them
//! against the task store's own serialization (Postgres row CAS).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::message::Capabilities;

/// Liveness/assignment status of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Offline,
    Online,
    Busy,
    Error,
}

/// One agent's registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct AgentEntry {
    pub id: String,
    pub status: AgentStatus,
    pub current_task_id: Option<uuid::Uuid>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub capabilities: Capabilities,
    pub connected_at: DateTime<Utc>,
}

impl AgentEntry {
    fn online(id: String, capabilities: Capabilities, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: AgentStatus::Online,
            current_task_id: None,
            last_heartbeat: Some(now),
            capabilities,
            connected_at: now,
        }
    }
}

/// Error returned by [`AgentRegistry::bind`] when the precondition doesn't hold.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BindError {
    #[error("agent {0} is not registered")]
    UnknownAgent(String),
    #[error("agent {0} is not online (status={1:?})")]
    NotOnline(String, AgentStatus),
    #[error("agent {0} already has task {1} bound")]
    AlreadyBusy(String, uuid::Uuid),
}

/// The in-memory agent registry, shared across the orchestrator process.
pub struct AgentRegistry {
    agents: Mutex<HashMap<String, AgentEntry>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or re-register) an agent as ONLINE. Used on the first
    /// `connect` frame of a connection.
    pub async fn upsert_online(&self, agent_id: &str, capabilities: Capabilities, now: DateTime<Utc>) {
        let mut agents = self.agents.lock().await;
        agents.insert(
            agent_id.to_string(),
            AgentEntry::online(agent_id.to_string(), capabilities, now),
        );
    }

    /// Transition an agent to OFFLINE, clearing its binding and heartbeat.
    /// Returns the task id it was bound to, if any (caller fails that task).
    pub async fn mark_offline(&self, agent_id: &str) -> Option<uuid::Uuid> {
        let mut agents = self.agents.lock().await;
        let Some(entry) = agents.get_mut(agent_id) else {
            return None;
        };
        let task_id = entry.current_task_id.take();
        entry.status = AgentStatus::Offline;
        entry.last_heartbeat = None;
        task_id
    }

    /// Transition an agent to ERROR without clearing its binding -- the
    /// intermediate state the connection manager's heartbeat sweep reports
    /// through before the offline transition.
    pub async fn mark_error(&self, agent_id: &str) {
        let mut agents = self.agents.lock().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.status = AgentStatus::Error;
        }
    }

    pub async fn touch_heartbeat(&self, agent_id: &str, now: DateTime<Utc>) {
        let mut agents = self.agents.lock().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.last_heartbeat = Some(now);
            if entry.status == AgentStatus::Error {
                entry.status = AgentStatus::Online;
            }
        }
    }

    /// Bind a task to an agent. Preconditions: agent is ONLINE and has no
    /// current task. Postcondition: BUSY.
    pub async fn bind(&self, agent_id: &str, task_id: uuid::Uuid) -> Result<(), BindError> {
        let mut agents = self.agents.lock().await;
        let entry = agents
            .get_mut(agent_id)
            .ok_or_else(|| BindError::UnknownAgent(agent_id.to_string()))?;
        if entry.status != AgentStatus::Online {
            return Err(BindError::NotOnline(agent_id.to_string(), entry.status));
        }
        if let Some(existing) = entry.current_task_id {
            return Err(BindError::AlreadyBusy(agent_id.to_string(), existing));
        }
        entry.current_task_id = Some(task_id);
        entry.status = AgentStatus::Busy;
        Ok(())
    }

    /// Unbind an agent's current task, returning it to ONLINE (idle).
    pub async fn unbind(&self, agent_id: &str) {
        let mut agents = self.agents.lock().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.current_task_id = None;
            if entry.status == AgentStatus::Busy {
                entry.status = AgentStatus::Online;
            }
        }
    }

    /// Pick an idle (ONLINE, unbound) agent. Tie-break is deterministic for
    /// a given snapshot: smallest id.
    pub async fn pick_idle(&self) -> Option<String> {
        let agents = self.agents.lock().await;
        agents
            .values()
            .filter(|e| e.status == AgentStatus::Online)
            .map(|e| e.id.clone())
            .min()
    }

    /// Agents whose last heartbeat predates `deadline` and are not already
    /// OFFLINE -- the connection manager's sweep target set.
    pub async fn timed_out(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> Vec<String> {
        let agents = self.agents.lock().await;
        agents
            .values()
            .filter(|e| e.status != AgentStatus::Offline)
            .filter(|e| match e.last_heartbeat {
                Some(hb) => now - hb > timeout,
                None => false,
            })
            .map(|e| e.id.clone())
            .collect()
    }

    /// Snapshot the whole registry, e.g. for `GET /api/agents` or an
    /// `agents_update` broadcast.
    pub async fn snapshot(&self) -> HashMap<String, AgentEntry> {
        self.agents.lock().await.clone()
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentEntry> {
        self.agents.lock().await.get(agent_id).cloned()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> Capabilities {
        Capabilities::reference()
    }

    #[tokio::test]
    async fn upsert_then_bind_then_unbind() {
        let reg = AgentRegistry::new();
        let now = Utc::now();
        reg.upsert_online("a1", caps(), now).await;

        let task_id = uuid::Uuid::new_v4();
        reg.bind("a1", task_id).await.unwrap();

        let entry = reg.get("a1").await.unwrap();
        assert_eq!(entry.status, AgentStatus::Busy);
        assert_eq!(entry.current_task_id, Some(task_id));

        reg.unbind("a1").await;
        let entry = reg.get("a1").await.unwrap();
        assert_eq!(entry.status, AgentStatus::Online);
        assert!(entry.current_task_id.is_none());
    }

    #[tokio::test]
    async fn bind_rejects_already_busy() {
        let reg = AgentRegistry::new();
        reg.upsert_online("a1", caps(), Utc::now()).await;
        reg.bind("a1", uuid::Uuid::new_v4()).await.unwrap();

        let err = reg.bind("a1", uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, BindError::AlreadyBusy(_, _)));
    }

    #[tokio::test]
    async fn bind_rejects_offline_agent() {
        let reg = AgentRegistry::new();
        let err = reg.bind("ghost", uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, BindError::UnknownAgent(_)));
    }

    #[tokio::test]
    async fn pick_idle_is_deterministic_smallest_id() {
        let reg = AgentRegistry::new();
        reg.upsert_online("zebra", caps(), Utc::now()).await;
        reg.upsert_online("alpha", caps(), Utc::now()).await;
        reg.upsert_online("mid", caps(), Utc::now()).await;

        assert_eq!(reg.pick_idle().await, Some("alpha".to_string()));
    }

    #[tokio::test]
    async fn pick_idle_skips_busy_agents() {
        let reg = AgentRegistry::new();
        reg.upsert_online("a1", caps(), Utc::now()).await;
        reg.bind("a1", uuid::Uuid::new_v4()).await.unwrap();

        assert_eq!(reg.pick_idle().await, None);
    }

    #[tokio::test]
    async fn mark_offline_clears_binding_and_returns_task() {
        let reg = AgentRegistry::new();
        reg.upsert_online("a1", caps(), Utc::now()).await;
        let task_id = uuid::Uuid::new_v4();
        reg.bind("a1", task_id).await.unwrap();

        let returned = reg.mark_offline("a1").await;
        assert_eq!(returned, Some(task_id));

        let entry = reg.get("a1").await.unwrap();
        assert_eq!(entry.status, AgentStatus::Offline);
        assert!(entry.current_task_id.is_none());
        assert!(entry.last_heartbeat.is_none());
    }

    #[tokio::test]
    async fn timed_out_finds_stale_heartbeats() {
        let reg = AgentRegistry::new();
        let stale = Utc::now() - chrono::Duration::seconds(200);
        reg.upsert_online("stale", caps(), stale).await;
        reg.upsert_online("fresh", caps(), Utc::now()).await;

        let timed_out = reg.timed_out(Utc::now(), chrono::Duration::seconds(90)).await;
        assert_eq!(timed_out, vec!["stale".to_string()]);
    }

    #[tokio::test]
    async fn touch_heartbeat_clears_error_status() {
        let reg = AgentRegistry::new();
        reg.upsert_online("a1", caps(), Utc::now()).await;
        reg.mark_error("a1").await;
        assert_eq!(reg.get("a1").await.unwrap().status, AgentStatus::Error);

        reg.touch_heartbeat("a1", Utc::now()).await;
        assert_eq!(reg.get("a1").await.unwrap().status, AgentStatus::Online);
    }
}
