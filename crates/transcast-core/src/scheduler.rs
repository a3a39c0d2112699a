//! The scheduler: matches PENDING tasks to IDLE agents.
//!
//! `TaskStore` and `Dispatch` are traits rather than concrete Postgres/
//! WebSocket types so the matching algorithm itself -- the part that is
//! genuinely load-bearing -- can be unit-tested with in-memory doubles,
//! with no network and no database (see the `tests` module below).

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use transcast_db::models::Task;
use uuid::Uuid;

use crate::message::OrchestratorFrame;
use crate::registry::AgentRegistry;

/// The task-store operations the scheduler needs. Implemented against
/// Postgres by the orchestrator binary (wrapping `transcast_db::queries::tasks`);
/// implemented in-memory for unit tests here.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn next_pending(&self) -> Result<Option<Task>>;
    async fn assign(&self, id: Uuid, agent_id: &str) -> Result<Option<Task>>;
    async fn reset_to_pending(&self, id: Uuid) -> Result<Option<Task>>;
}

/// The connection-manager operations the scheduler needs.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Send a frame to one agent. `false` on unknown agent, dead
    /// connection, or serialization error.
    async fn send_to(&self, agent_id: &str, frame: OrchestratorFrame) -> bool;
    /// Broadcast a `task_update`/`agents_update` pair to observers after a
    /// successful assignment.
    async fn broadcast_assignment(&self, task: &Task, registry: &AgentRegistry);
}

/// Matches PENDING tasks to IDLE agents in priority/FIFO order. Owns the
/// re-entrancy guard: a trigger arriving while `try_assign` already runs
/// waits for the mutex rather than interleaving.
pub struct Scheduler<S: TaskStore, D: Dispatch> {
    store: Arc<S>,
    registry: Arc<AgentRegistry>,
    dispatch: Arc<D>,
    guard: AsyncMutex<()>,
}

impl<S: TaskStore, D: Dispatch> Scheduler<S, D> {
    pub fn new(store: Arc<S>, registry: Arc<AgentRegistry>, dispatch: Arc<D>) -> Self {
        Self {
            store,
            registry,
            dispatch,
            guard: AsyncMutex::new(()),
        }
    }

    /// Run the matching loop until no more PENDING tasks or no more IDLE
    /// agents remain. Call after task creation, task restart, a terminal
    /// transition on an agent, or a new agent becoming ONLINE.
    pub async fn try_assign(&self) -> Result<()> {
        let _permit = self.guard.lock().await;

        loop {
            let Some(pending) = self.store.next_pending().await? else {
                break;
            };

            let Some(agent_id) = self.registry.pick_idle().await else {
                break;
            };

            let assigned = match self.store.assign(pending.id, &agent_id).await? {
                Some(task) => task,
                // Lost the CAS race to another caller; retry the loop.
                None => continue,
            };

            if let Err(e) = self.registry.bind(&agent_id, assigned.id).await {
                // The agent registry moved out from under us between
                // pick_idle and bind (e.g. it went OFFLINE). Roll the
                // assignment back and stop -- the caller that triggers the
                // state change which knocked the agent out will also
                // trigger a fresh try_assign.
                tracing::warn!(agent_id, task_id = %assigned.id, error = %e, "bind failed after assign, rolling back");
                let _ = self.store.reset_to_pending(assigned.id).await?;
                break;
            }

            let ok = self
                .dispatch
                .send_to(&agent_id, OrchestratorFrame::Assign { task: assigned.clone() })
                .await;

            if !ok {
                tracing::warn!(agent_id, task_id = %assigned.id, "dispatch send failed, rolling back assignment");
                let _ = self.store.reset_to_pending(assigned.id).await?;
                self.registry.unbind(&agent_id).await;
                break;
            }

            self.dispatch.broadcast_assignment(&assigned, &self.registry).await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Capabilities;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use transcast_db::models::{Priority, TaskStatus};

    /// A minimal in-memory task store double that honors the CAS
    /// semantics of `assign` without touching Postgres.
    struct MemTaskStore {
        tasks: Mutex<HashMap<Uuid, Task>>,
    }

    fn make_task(priority: Priority, created_offset_secs: i64) -> Task {
        Task {
            id: Uuid::new_v4(),
            priority,
            status: TaskStatus::Pending,
            agent_id: None,
            input_files: serde_json::json!([]),
            output_settings: serde_json::json!({}),
            progress: 0.0,
            created_at: chrono::Utc::now() + chrono::Duration::seconds(created_offset_secs),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    impl MemTaskStore {
        fn new(tasks: Vec<Task>) -> Self {
            Self {
                tasks: Mutex::new(tasks.into_iter().map(|t| (t.id, t)).collect()),
            }
        }

        fn snapshot(&self, id: Uuid) -> Task {
            self.tasks.lock().unwrap().get(&id).unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskStore for MemTaskStore {
        async fn next_pending(&self) -> Result<Option<Task>> {
            let tasks = self.tasks.lock().unwrap();
            Ok(tasks
                .values()
                .filter(|t| t.status == TaskStatus::Pending)
                .max_by(|a, b| {
                    a.priority
                        .cmp(&b.priority)
                        .then(b.created_at.cmp(&a.created_at))
                })
                .cloned())
        }

        async fn assign(&self, id: Uuid, agent_id: &str) -> Result<Option<Task>> {
            let mut tasks = self.tasks.lock().unwrap();
            let task = tasks.get_mut(&id).unwrap();
            if task.status != TaskStatus::Pending {
                return Ok(None);
            }
            task.status = TaskStatus::Assigned;
            task.agent_id = Some(agent_id.to_string());
            task.started_at = Some(chrono::Utc::now());
            Ok(Some(task.clone()))
        }

        async fn reset_to_pending(&self, id: Uuid) -> Result<Option<Task>> {
            let mut tasks = self.tasks.lock().unwrap();
            let task = tasks.get_mut(&id).unwrap();
            task.status = TaskStatus::Pending;
            task.agent_id = None;
            task.started_at = None;
            Ok(Some(task.clone()))
        }
    }

    /// A dispatch double whose `send_to` outcome is scripted per agent id.
    struct FakeDispatch {
        fail_agents: Vec<String>,
        sent: Mutex<Vec<(String, Uuid)>>,
        broadcasts: Mutex<Vec<Uuid>>,
    }

    impl FakeDispatch {
        fn new(fail_agents: Vec<&str>) -> Self {
            Self {
                fail_agents: fail_agents.into_iter().map(str::to_string).collect(),
                sent: Mutex::new(Vec::new()),
                broadcasts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Dispatch for FakeDispatch {
        async fn send_to(&self, agent_id: &str, frame: OrchestratorFrame) -> bool {
            let OrchestratorFrame::Assign { task } = frame else {
                panic!("scheduler only ever sends Assign frames");
            };
            self.sent.lock().unwrap().push((agent_id.to_string(), task.id));
            !self.fail_agents.contains(&agent_id.to_string())
        }

        async fn broadcast_assignment(&self, task: &Task, _registry: &AgentRegistry) {
            self.broadcasts.lock().unwrap().push(task.id);
        }
    }

    #[tokio::test]
    async fn assigns_highest_priority_first() {
        let lo = make_task(Priority::Low, 0);
        let hi = make_task(Priority::High, 10); // created later, still wins
        let store = Arc::new(MemTaskStore::new(vec![lo.clone(), hi.clone()]));
        let registry = Arc::new(AgentRegistry::new());
        registry.upsert_online("a1", Capabilities::reference(), chrono::Utc::now()).await;
        let dispatch = Arc::new(FakeDispatch::new(vec![]));

        let scheduler = Scheduler::new(store.clone(), registry.clone(), dispatch.clone());
        scheduler.try_assign().await.unwrap();

        assert_eq!(store.snapshot(hi.id).status, TaskStatus::Assigned);
        assert_eq!(store.snapshot(lo.id).status, TaskStatus::Pending);
        assert_eq!(dispatch.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stops_when_no_idle_agents() {
        let t = make_task(Priority::Medium, 0);
        let store = Arc::new(MemTaskStore::new(vec![t.clone()]));
        let registry = Arc::new(AgentRegistry::new());
        let dispatch = Arc::new(FakeDispatch::new(vec![]));

        Scheduler::new(store.clone(), registry, dispatch.clone())
            .try_assign()
            .await
            .unwrap();

        assert_eq!(store.snapshot(t.id).status, TaskStatus::Pending);
        assert!(dispatch.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dispatch_failure_rolls_back_to_pending_and_unbinds() {
        let t = make_task(Priority::Medium, 0);
        let store = Arc::new(MemTaskStore::new(vec![t.clone()]));
        let registry = Arc::new(AgentRegistry::new());
        registry.upsert_online("flaky", Capabilities::reference(), chrono::Utc::now()).await;
        let dispatch = Arc::new(FakeDispatch::new(vec!["flaky"]));

        Scheduler::new(store.clone(), registry.clone(), dispatch.clone())
            .try_assign()
            .await
            .unwrap();

        let reloaded = store.snapshot(t.id);
        assert_eq!(reloaded.status, TaskStatus::Pending);
        assert!(reloaded.agent_id.is_none());
        assert!(reloaded.started_at.is_none());

        let entry = registry.get("flaky").await.unwrap();
        assert!(entry.current_task_id.is_none());
        assert!(dispatch.broadcasts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn assigns_multiple_tasks_to_multiple_idle_agents() {
        let t1 = make_task(Priority::High, 0);
        let t2 = make_task(Priority::Medium, 0);
        let store = Arc::new(MemTaskStore::new(vec![t1.clone(), t2.clone()]));
        let registry = Arc::new(AgentRegistry::new());
        registry.upsert_online("a1", Capabilities::reference(), chrono::Utc::now()).await;
        registry.upsert_online("a2", Capabilities::reference(), chrono::Utc::now()).await;
        let dispatch = Arc::new(FakeDispatch::new(vec![]));

        Scheduler::new(store.clone(), registry, dispatch.clone())
            .try_assign()
            .await
            .unwrap();

        assert_eq!(store.snapshot(t1.id).status, TaskStatus::Assigned);
        assert_eq!(store.snapshot(t2.id).status, TaskStatus::Assigned);
        assert_eq!(dispatch.sent.lock().unwrap().len(), 2);
    }
}
