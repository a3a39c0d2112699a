//! The agent-facing WebSocket endpoint: one task per connection, reading
//! frames and routing them to state transitions per the inbound routing
//! table (connect/heartbeat/progress/complete/failed/reconnect).

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use transcast_core::message::{AgentFrame, OrchestratorFrame};
use transcast_db::queries::tasks;
use uuid::Uuid;

use crate::connection::log_agent_connected;
use crate::state::AppState;

const PROTOCOL_VIOLATION: u16 = 1003;

type WsSender = SplitSink<WebSocket, Message>;

pub async fn agent_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

async fn handle_agent_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OrchestratorFrame>();

    let mut agent_id: Option<String> = None;
    let mut first_frame = true;
    // Set when a `reconnect{status:"running"}` arrives before the `connect`
    // that follows it -- the agent isn't registered yet, so the rebind is
    // deferred until the registry entry exists.
    let mut pending_resume_task: Option<Uuid> = None;

    'conn: loop {
        tokio::select! {
            biased;

            // Flush anything dispatch handlers queued for this agent --
            // checked first each iteration so assignments reach an idle
            // agent as soon as they're queued, not only when it next speaks.
            queued = out_rx.recv() => {
                let Some(queued) = queued else { continue };
                if send_frame(&mut ws_tx, &queued).await.is_err() {
                    break 'conn;
                }
            }

            next = ws_rx.next() => {
                let Some(next) = next else { break 'conn };
                let msg = match next {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(error = %e, "agent socket read error");
                        break 'conn;
                    }
                };

                let text = match msg {
                    Message::Text(t) => t.to_string(),
                    Message::Close(_) => break 'conn,
                    _ => continue,
                };

                let frame: AgentFrame = match serde_json::from_str(&text) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(error = %e, raw = %text, "malformed agent frame, closing connection");
                        close_with_violation(&mut ws_tx, "malformed frame").await;
                        break 'conn;
                    }
                };

                if first_frame {
                    first_frame = false;
                    if !matches!(frame, AgentFrame::Connect { .. } | AgentFrame::Reconnect { .. }) {
                        warn!(kind = frame.kind(), "illegal opening frame type");
                        close_with_violation(&mut ws_tx, "connection must open with connect or reconnect").await;
                        break 'conn;
                    }
                }

                match frame {
                    AgentFrame::Connect { agent_id: aid, data } => {
                        log_agent_connected(&aid);
                        state.registry.upsert_online(&aid, data.capabilities, Utc::now()).await;
                        state.connections.register_agent(&aid, out_tx.clone()).await;

                        if let Some(task_id) = pending_resume_task.take() {
                            if let Err(e) = state.registry.bind(&aid, task_id).await {
                                warn!(agent_id = %aid, %task_id, error = %e, "failed to rebind resumed task");
                            }
                        }

                        agent_id = Some(aid);
                        let _ = out_tx.send(OrchestratorFrame::Acknowledge {
                            message: "connected".to_string(),
                        });
                        if let Err(e) = state.scheduler.try_assign().await {
                            warn!(error = %e, "try_assign failed after connect");
                        }
                    }
                    AgentFrame::Heartbeat { agent_id: aid } => {
                        state.registry.touch_heartbeat(&aid, Utc::now()).await;
                    }
                    AgentFrame::Progress { agent_id: aid, task_id, data } => {
                        handle_progress(&state, &aid, task_id, data.progress).await;
                    }
                    AgentFrame::Complete { agent_id: aid, task_id } => {
                        handle_terminal(&state, &aid, task_id, None).await;
                    }
                    AgentFrame::Failed { agent_id: aid, task_id, data } => {
                        handle_terminal(&state, &aid, task_id, Some(data.error)).await;
                    }
                    AgentFrame::Reconnect { agent_id: aid, task_id, data } => {
                        if let Some(resume_id) = handle_reconnect(&state, &aid, task_id, data).await {
                            pending_resume_task = Some(resume_id);
                        }
                    }
                    AgentFrame::Unknown => {
                        debug!("ignoring unknown agent frame kind");
                    }
                }
            }
        }
    }

    if let Some(aid) = agent_id {
        state.connections.remove_agent(&aid).await;
        if let Some(task_id) = state.registry.mark_offline(&aid).await {
            match tasks::fail(&state.pool, task_id, "agent lost").await {
                Ok(Some(task)) => state.connections.broadcast_assignment(&task, &state.registry).await,
                Ok(None) => {}
                Err(e) => warn!(task_id = %task_id, error = %e, "failed to fail task on disconnect"),
            }
        }
        if let Err(e) = state.scheduler.try_assign().await {
            warn!(error = %e, "try_assign failed after disconnect");
        }
        info!(agent_id = %aid, "agent disconnected");
    }
}

async fn send_frame(ws_tx: &mut WsSender, frame: &OrchestratorFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).expect("OrchestratorFrame always serializes");
    ws_tx.send(Message::Text(text.into())).await
}

async fn close_with_violation(ws_tx: &mut WsSender, reason: &str) {
    warn!(reason, code = PROTOCOL_VIOLATION, "closing agent connection");
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code: PROTOCOL_VIOLATION,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn handle_progress(state: &AppState, agent_id: &str, task_id: Uuid, progress: f64) {
    let Some(entry) = state.registry.get(agent_id).await else {
        warn!(agent_id, %task_id, "progress from unregistered agent, ignoring");
        return;
    };
    if entry.current_task_id != Some(task_id) {
        warn!(agent_id, %task_id, "progress for task not bound to this agent, ignoring");
        return;
    }

    match tasks::update_progress(&state.pool, task_id, progress).await {
        Ok(Some(task)) => state.connections.broadcast_assignment(&task, &state.registry).await,
        Ok(None) => {}
        Err(e) => warn!(%task_id, error = %e, "failed to record progress"),
    }
}

async fn handle_terminal(state: &AppState, agent_id: &str, task_id: Uuid, error: Option<String>) {
    let Some(entry) = state.registry.get(agent_id).await else {
        warn!(agent_id, %task_id, "terminal report from unregistered agent, ignoring");
        return;
    };
    if entry.current_task_id != Some(task_id) {
        warn!(agent_id, %task_id, "terminal report for task not bound to this agent, ignoring");
        return;
    }

    let result = match &error {
        Some(msg) => tasks::fail(&state.pool, task_id, msg).await,
        None => tasks::complete(&state.pool, task_id).await,
    };

    state.registry.unbind(agent_id).await;

    match result {
        Ok(Some(task)) => state.connections.broadcast_assignment(&task, &state.registry).await,
        Ok(None) => {}
        Err(e) => warn!(%task_id, error = %e, "failed to record terminal outcome"),
    }

    if let Err(e) = state.scheduler.try_assign().await {
        warn!(error = %e, "try_assign failed after terminal report");
    }
}

/// Handles a `reconnect` frame. Returns `Some(task_id)` when the caller
/// should rebind that task once the `connect` frame that follows has
/// (re-)registered the agent in the registry.
async fn handle_reconnect(
    state: &AppState,
    agent_id: &str,
    task_id: Uuid,
    data: transcast_core::message::ReconnectData,
) -> Option<Uuid> {
    use transcast_core::message::ReconnectStatus;

    match data.status {
        ReconnectStatus::Failed => {
            let message = data.error.unwrap_or_else(|| "agent reconnected with a failed task".to_string());
            match tasks::fail(&state.pool, task_id, &message).await {
                Ok(Some(task)) => state.connections.broadcast_assignment(&task, &state.registry).await,
                Ok(None) => {}
                Err(e) => warn!(%task_id, error = %e, "failed to fail task on reconnect"),
            }
            if let Err(e) = state.scheduler.try_assign().await {
                warn!(error = %e, "try_assign failed after reconnect-failed");
            }
            None
        }
        ReconnectStatus::Running => {
            let _ = agent_id;
            Some(task_id)
        }
    }
}
