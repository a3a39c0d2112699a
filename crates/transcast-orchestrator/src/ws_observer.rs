//! The observer-facing WebSocket endpoint: write-only fan-out of task and
//! agent updates. An observer gets a full `agents_update` snapshot the
//! moment it connects, then incremental broadcasts as they happen.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;
use transcast_core::message::ObserverFrame;

use crate::state::AppState;

pub async fn observer_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_observer_socket(socket, state))
}

async fn handle_observer_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ObserverFrame>();

    state.connections.register_observer(tx).await;

    let snapshot = state.registry.snapshot().await;
    let agents = serde_json::to_value(&snapshot).unwrap_or_else(|_| serde_json::json!({}));
    if send_frame(&mut ws_tx, &ObserverFrame::AgentsUpdate { agents }).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            biased;

            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if send_frame(&mut ws_tx, &frame).await.is_err() {
                    break;
                }
            }

            // Observers don't send anything meaningful; this is just here
            // to notice the socket closing so the task can exit instead of
            // leaking a registered (but dead) sender.
            next = ws_rx.next() => {
                match next {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(error = %e, "observer socket read error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn send_frame(
    ws_tx: &mut futures::stream::SplitSink<WebSocket, Message>,
    frame: &ObserverFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).expect("ObserverFrame always serializes");
    ws_tx.send(Message::Text(text.into())).await
}
