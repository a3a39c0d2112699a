use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Scheduling priority of a task. Ordering is HIGH > MEDIUM > LOW.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = PriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(PriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Priority`] string.
#[derive(Debug, Clone)]
pub struct PriorityParseError(pub String);

impl fmt::Display for PriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid priority: {:?}", self.0)
    }
}

impl std::error::Error for PriorityParseError {}

// ---------------------------------------------------------------------------

/// Status of a task. Forms the DAG:
///
/// ```text
/// pending   -> assigned, cancelled
/// assigned  -> running, failed, cancelled
/// running   -> completed, failed, cancelled
/// failed    -> pending    (restart)
/// completed, cancelled are terminal
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions possible
    /// except broadcasts re-announcing the same state).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A `{storage_id, path}` reference, used for both task inputs and the
/// output target. Stored as JSON; `storage_id` is resolved to an absolute
/// path prefix by the agent's `STORAGE_MAP` at task-arrival time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageRef {
    pub storage_id: String,
    pub path: String,
}

/// Output encoding settings. `codec` and `resolution` are required by the
/// transcoder harness; any additional keys the caller sends are preserved
/// in `extra` so forward-compatible clients don't lose data on round-trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputSettings {
    pub storage_id: String,
    pub path: String,
    pub codec: String,
    pub resolution: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A transcoding task -- the unit of work dispatched to exactly one agent.
///
/// See the invariants enforced by [`crate::queries::tasks`]: `pending`
/// implies no agent/start time, `assigned`/`running` imply both,
/// `completed` implies `progress = 100`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub priority: Priority,
    pub status: TaskStatus,
    pub agent_id: Option<String>,
    pub input_files: serde_json::Value,
    pub output_settings: serde_json::Value,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Task {
    /// Deserialize `input_files` into the typed `[StorageRef]` sequence.
    pub fn input_files_typed(&self) -> Result<Vec<StorageRef>, serde_json::Error> {
        serde_json::from_value(self.input_files.clone())
    }

    /// Deserialize `output_settings` into the typed form.
    pub fn output_settings_typed(&self) -> Result<OutputSettings, serde_json::Error> {
        serde_json::from_value(self.output_settings.clone())
    }
}

/// Fields accepted when creating a new task. `priority` defaults to
/// `Medium` when absent.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    #[serde(default = "default_priority")]
    pub priority: Priority,
    pub input_files: serde_json::Value,
    pub output_settings: serde_json::Value,
}

fn default_priority() -> Priority {
    Priority::Medium
}
