//! Database query functions for the `tasks` table.
//!
//! Every mutation that changes `status` is expressed as a conditional
//! `UPDATE ... WHERE status = $from`, so the compare-and-swap semantics
//! required for `assign` (and every other transition) hold even when two
//! callers race -- the loser's `UPDATE` touches zero rows and the caller
//! observes that via `Ok(None)`.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{NewTask, Priority, Task, TaskStatus};

/// Insert a new task row with `status = pending`.
pub async fn create(pool: &PgPool, spec: &NewTask) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (priority, input_files, output_settings) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(spec.priority)
    .bind(&spec.input_files)
    .bind(&spec.output_settings)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by id.
pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List tasks, optionally filtered by status, newest first.
pub async fn list(pool: &PgPool, filter_status: Option<TaskStatus>) -> Result<Vec<Task>> {
    let tasks = match filter_status {
        Some(status) => {
            sqlx::query_as::<_, Task>(
                "SELECT * FROM tasks WHERE status = $1 ORDER BY created_at DESC",
            )
            .bind(status)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY created_at DESC")
                .fetch_all(pool)
                .await
        }
    }
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// Return the next task to dispatch: highest priority, then oldest first.
/// This ordering *is* the scheduling policy (see scheduler::try_assign).
/// `priority` is stored as text, so the ordering is expressed over an
/// explicit rank rather than `ORDER BY priority DESC` -- lexicographic
/// order on `{low, medium, high}` does not match priority order.
pub async fn next_pending(pool: &PgPool) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = 'pending' \
         ORDER BY CASE priority WHEN 'high' THEN 3 WHEN 'medium' THEN 2 ELSE 1 END DESC, \
                  created_at ASC \
         LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .context("failed to query next pending task")?;

    Ok(task)
}

/// Atomically bind a PENDING task to an agent. Returns `Ok(None)` if the
/// task was not PENDING at the time of the call (lost the CAS race, or
/// caller has a stale task id) -- this is an expected outcome the
/// scheduler retries on, not an error.
pub async fn assign(pool: &PgPool, id: Uuid, agent_id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'assigned', agent_id = $1, started_at = now() \
         WHERE id = $2 AND status = 'pending' \
         RETURNING *",
    )
    .bind(agent_id)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to assign task")?;

    Ok(task)
}

/// Update a task's priority. Allowed at any (including terminal) status --
/// priority only affects future scheduling decisions, so there's nothing to
/// guard against.
pub async fn update_priority(pool: &PgPool, id: Uuid, priority: Priority) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks SET priority = $1 WHERE id = $2 RETURNING *",
    )
    .bind(priority)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to update task priority")?;

    Ok(task)
}

/// Record a progress update. Promotes ASSIGNED -> RUNNING on the first
/// report. No-ops (returns `Ok(None)`) outside of {assigned, running}.
pub async fn update_progress(pool: &PgPool, id: Uuid, progress: f64) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET progress = $1, \
             status = CASE WHEN status = 'assigned' THEN 'running' ELSE status END \
         WHERE id = $2 AND status IN ('assigned', 'running') \
         RETURNING *",
    )
    .bind(progress)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to update task progress")?;

    Ok(task)
}

/// Terminal transition to COMPLETED. Valid only from ASSIGNED/RUNNING, per
/// the state machine; a duplicate `complete` frame for an already-completed
/// task lands outside that set and is a no-op (`Ok(None)`) rather than an
/// error, so retransmission is idempotent.
pub async fn complete(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'completed', progress = 100.0, completed_at = now() \
         WHERE id = $1 AND status IN ('assigned', 'running') \
         RETURNING *",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to complete task")?;

    Ok(task)
}

/// Terminal transition to FAILED with an error message.
pub async fn fail(pool: &PgPool, id: Uuid, message: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'failed', error_message = $1, completed_at = now() \
         WHERE id = $2 AND status NOT IN ('completed', 'cancelled', 'failed') \
         RETURNING *",
    )
    .bind(message)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to fail task")?;

    Ok(task)
}

/// Restart a FAILED task: clear agent/error/progress/timestamps and
/// return to PENDING so the scheduler can pick it back up.
pub async fn reset_to_pending(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'pending', agent_id = NULL, error_message = NULL, \
             progress = 0.0, started_at = NULL, completed_at = NULL \
         WHERE id = $1 AND status = 'failed' \
         RETURNING *",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to reset task to pending")?;

    Ok(task)
}

/// Cancel a task. Rejected (returns `Ok(None)`) for RUNNING/ASSIGNED when
/// `allow_in_flight` is false -- the REST surface never sets it; the
/// scheduler's dispatch-failure rollback path does not call this at all
/// (it uses [`reset_to_pending`] instead).
pub async fn cancel(pool: &PgPool, id: Uuid, allow_in_flight: bool) -> Result<Option<Task>> {
    let query = if allow_in_flight {
        "UPDATE tasks SET status = 'cancelled', completed_at = now() \
         WHERE id = $1 AND status NOT IN ('completed', 'cancelled') \
         RETURNING *"
    } else {
        "UPDATE tasks SET status = 'cancelled', completed_at = now() \
         WHERE id = $1 AND status = 'pending' \
         RETURNING *"
    };

    let task = sqlx::query_as::<_, Task>(query)
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to cancel task")?;

    Ok(task)
}

/// Error returned by [`delete`] when the task is in flight.
#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error("task {0} not found")]
    NotFound(Uuid),
    #[error("cannot delete task {0} while it is {1}")]
    Conflict(Uuid, TaskStatus),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Delete a task row. Forbidden while ASSIGNED/RUNNING.
pub async fn delete(pool: &PgPool, id: Uuid) -> Result<(), DeleteError> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DeleteError::NotFound(id))?;

    if matches!(task.status, TaskStatus::Assigned | TaskStatus::Running) {
        return Err(DeleteError::Conflict(id, task.status));
    }

    sqlx::query("DELETE FROM tasks WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Startup reconciliation: the in-memory agent registry is always empty on
/// a fresh orchestrator process, so any task left ASSIGNED/RUNNING from a
/// previous process incarnation is dangling -- no agent will ever report
/// on it again. Demote them all to FAILED so an operator (or a future
/// restart-to-pending policy) can act on them. Returns the reconciled
/// task ids.
pub async fn reconcile_dangling_on_startup(pool: &PgPool) -> Result<Vec<Uuid>> {
    let now = Utc::now();
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "UPDATE tasks \
         SET status = 'failed', error_message = 'orchestrator restarted mid-task', completed_at = $1 \
         WHERE status IN ('assigned', 'running') \
         RETURNING id",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to reconcile dangling tasks")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}
