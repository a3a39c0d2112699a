//! Wire protocol: the tagged union of JSON frames exchanged over the
//! agent/observer WebSocket connections.
//!
//! Every frame is `{"type": "...", ...}`. Known kinds deserialize into a
//! typed variant; anything else falls into `Unknown` so the dispatcher can
//! log-and-ignore rather than fail the whole connection on a forward-
//! compatible field it doesn't recognise yet. A genuinely malformed known
//! kind (missing a required field) fails serde deserialization, which the
//! caller treats as a protocol violation (close code 1003).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use transcast_db::models::Task;

/// Capabilities an agent advertises on `connect`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub codecs: Vec<String>,
    pub formats: Vec<String>,
}

impl Capabilities {
    /// Capabilities advertised by the reference agent binary.
    pub fn reference() -> Self {
        Self {
            codecs: vec!["h264".into(), "h265".into(), "vp9".into()],
            formats: vec!["mp4".into(), "webm".into(), "mkv".into()],
        }
    }
}

/// Status reported in a `reconnect` frame's `data.status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectStatus {
    Failed,
    Running,
}

// ---------------------------------------------------------------------------
// Agent -> Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectData {
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressData {
    pub progress: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedData {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectData {
    pub status: ReconnectStatus,
    #[serde(default)]
    pub error: Option<String>,
}

/// A frame sent by an agent to the orchestrator. `Serialize` is used by the
/// agent binary to emit frames; `Deserialize` is used by the orchestrator to
/// read them. Both sides share this one type rather than keeping mirrored
/// request/response definitions in sync by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    Connect {
        agent_id: String,
        data: ConnectData,
    },
    Heartbeat {
        agent_id: String,
    },
    Progress {
        agent_id: String,
        task_id: uuid::Uuid,
        data: ProgressData,
    },
    Complete {
        agent_id: String,
        task_id: uuid::Uuid,
    },
    Failed {
        agent_id: String,
        task_id: uuid::Uuid,
        data: FailedData,
    },
    Reconnect {
        agent_id: String,
        task_id: uuid::Uuid,
        data: ReconnectData,
    },
    /// Forward-compatible catch-all for unrecognised `type` values. Logged
    /// and ignored by the dispatcher rather than closing the connection.
    #[serde(other)]
    Unknown,
}

impl AgentFrame {
    /// The frame's `type` discriminator, for logging unknown/ignored frames.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Progress { .. } => "progress",
            Self::Complete { .. } => "complete",
            Self::Failed { .. } => "failed",
            Self::Reconnect { .. } => "reconnect",
            Self::Unknown => "unknown",
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator -> Agent
// ---------------------------------------------------------------------------

/// A frame sent by the orchestrator to an agent. `Deserialize` is used by the
/// agent binary to read frames off the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorFrame {
    Assign { task: Task },
    Cancel { task: CancelTaskRef },
    Ping,
    Acknowledge { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelTaskRef {
    pub id: uuid::Uuid,
}

// ---------------------------------------------------------------------------
// Observer broadcast frames
// ---------------------------------------------------------------------------

/// A frame broadcast to observer connections.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverFrame {
    AgentsUpdate { agents: Value },
    TaskUpdate { task: Task },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_frame_round_trips() {
        let raw = serde_json::json!({
            "type": "connect",
            "agent_id": "agent-1",
            "data": {"capabilities": {"codecs": ["h264"], "formats": ["mp4"]}}
        });
        let frame: AgentFrame = serde_json::from_value(raw).unwrap();
        match frame {
            AgentFrame::Connect { agent_id, data } => {
                assert_eq!(agent_id, "agent-1");
                assert_eq!(data.capabilities.codecs, vec!["h264".to_string()]);
            }
            other => panic!("expected Connect, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_falls_back_instead_of_erroring() {
        let raw = serde_json::json!({"type": "future_frame_kind", "whatever": 1});
        let frame: AgentFrame = serde_json::from_value(raw).unwrap();
        assert!(matches!(frame, AgentFrame::Unknown));
    }

    #[test]
    fn missing_required_field_is_a_deserialize_error() {
        let raw = serde_json::json!({"type": "progress", "agent_id": "a1", "task_id": uuid::Uuid::nil()});
        let result: Result<AgentFrame, _> = serde_json::from_value(raw);
        assert!(result.is_err(), "progress without data.progress must fail to parse");
    }

    #[test]
    fn reconnect_status_parses_both_variants() {
        for (s, expected) in [("failed", ReconnectStatus::Failed), ("running", ReconnectStatus::Running)] {
            let raw = serde_json::json!({
                "type": "reconnect",
                "agent_id": "a1",
                "task_id": uuid::Uuid::nil(),
                "data": {"status": s}
            });
            let frame: AgentFrame = serde_json::from_value(raw).unwrap();
            match frame {
                AgentFrame::Reconnect { data, .. } => assert_eq!(data.status, expected),
                other => panic!("expected Reconnect, got {other:?}"),
            }
        }
    }
}
