//! Connection lifecycle: the connect/reconnect handshake, heartbeat
//! emission, assignment dispatch, and the backoff-driven reconnect loop.
//!
//! A transcode job, once spawned, outlives any single WebSocket session --
//! losing the connection mid-task does not interrupt the child `ffmpeg`
//! process. [`RunningJob`] is threaded across reconnect attempts in [`run`]
//! so a session that re-establishes finds the job (and its event stream)
//! exactly where the previous session left it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use transcast_core::backoff::Backoff;
use transcast_core::checkpoint::{Checkpoint, CheckpointStore};
use transcast_core::message::{
    AgentFrame, Capabilities, ConnectData, FailedData, OrchestratorFrame, ProgressData, ReconnectData,
    ReconnectStatus,
};
use transcast_core::transcoder::{self, OutputSpec, TranscodeEvent};
use transcast_db::models::Task;

use crate::config::AgentConfig;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A transcode job in flight, carried across reconnects.
struct RunningJob {
    task_id: Uuid,
    cancel: CancellationToken,
    events: mpsc::UnboundedReceiver<TranscodeEvent>,
}

/// Drive the agent for the lifetime of the process: connect, handshake,
/// run the message loop, and on any disconnect reconnect with backoff.
/// Returns only on a configuration error that no amount of retrying fixes
/// (none currently exist; the loop otherwise runs forever).
pub async fn run(config: AgentConfig) -> Result<()> {
    let checkpoint_store = CheckpointStore::new(&config.state_dir);
    let mut backoff = Backoff::new();
    let mut job: Option<RunningJob> = None;
    let mut first_connection = true;

    loop {
        match connect(&config.orchestrator_url).await {
            Ok(ws) => {
                backoff.reset();
                match run_session(&config, &checkpoint_store, ws, &mut job, &mut first_connection).await {
                    Ok(()) => info!(agent_id = %config.agent_id, "session ended, reconnecting"),
                    Err(e) => warn!(agent_id = %config.agent_id, error = %e, "session failed, reconnecting"),
                }
            }
            Err(e) => warn!(agent_id = %config.agent_id, error = %e, "failed to connect to orchestrator"),
        }

        let delay = backoff.next_delay();
        debug!(delay_secs = delay.as_secs(), "backing off before reconnect attempt");
        tokio::time::sleep(delay).await;
    }
}

async fn connect(url: &str) -> Result<Ws> {
    let (ws, _response) = tokio_tungstenite::connect_async(url)
        .await
        .with_context(|| format!("failed to connect to orchestrator at {url}"))?;
    Ok(ws)
}

#[cfg(unix)]
fn process_is_live(pid: u32) -> bool {
    // SAFETY: signal 0 sends no signal; it only checks for the process's
    // existence and that we have permission to signal it.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_is_live(_pid: u32) -> bool {
    true
}

/// Build the `reconnect` frame (if any) that must precede `connect` on this
/// connection attempt. Only the very first connection attempt of the
/// process consults the on-disk checkpoint for crash detection; every
/// subsequent reconnect reports the locally-known job, if one is running.
fn opening_reconnect_frame(
    agent_id: &str,
    checkpoint_store: &CheckpointStore,
    job: &Option<RunningJob>,
    first_connection: &mut bool,
) -> Option<AgentFrame> {
    if *first_connection {
        *first_connection = false;
        let checkpoint = checkpoint_store.load()?;
        if process_is_live(checkpoint.owner_process_id) {
            // Another live process owns this checkpoint; nothing crashed
            // from this process's point of view, so report nothing.
            return None;
        }
        if let Err(e) = checkpoint_store.clear() {
            warn!(error = %e, "failed to clear checkpoint after crash detection");
        }
        return Some(AgentFrame::Reconnect {
            agent_id: agent_id.to_string(),
            task_id: checkpoint.task_id,
            data: ReconnectData {
                status: ReconnectStatus::Failed,
                error: Some("Agent crashed during execution".to_string()),
            },
        });
    }

    job.as_ref().map(|j| AgentFrame::Reconnect {
        agent_id: agent_id.to_string(),
        task_id: j.task_id,
        data: ReconnectData {
            status: ReconnectStatus::Running,
            error: None,
        },
    })
}

async fn send_frame(ws: &mut Ws, frame: &AgentFrame) -> Result<()> {
    let text = serde_json::to_string(frame).expect("AgentFrame always serializes");
    ws.send(Message::Text(text.into())).await.context("failed to send frame")
}

/// Run one WebSocket session to completion. Returns `Ok(())` on an orderly
/// close, `Err` on a transport error; either way the caller reconnects.
async fn run_session(
    config: &AgentConfig,
    checkpoint_store: &CheckpointStore,
    mut ws: Ws,
    job: &mut Option<RunningJob>,
    first_connection: &mut bool,
) -> Result<()> {
    if let Some(frame) = opening_reconnect_frame(&config.agent_id, checkpoint_store, job, first_connection) {
        send_frame(&mut ws, &frame).await?;
    }

    send_frame(
        &mut ws,
        &AgentFrame::Connect {
            agent_id: config.agent_id.clone(),
            data: ConnectData {
                capabilities: Capabilities::reference(),
            },
        },
    )
    .await?;

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // first tick fires immediately; skip it, connect already doubles as a liveness signal

    loop {
        tokio::select! {
            biased;

            event = next_job_event(job) => {
                let Some(event) = event else { continue };
                handle_job_event(&mut ws, &config.agent_id, checkpoint_store, job, event).await?;
            }

            _ = heartbeat.tick() => {
                send_frame(&mut ws, &AgentFrame::Heartbeat { agent_id: config.agent_id.clone() }).await?;
            }

            incoming = ws.next() => {
                let Some(incoming) = incoming else { return Ok(()) };
                let msg = incoming.context("error reading from orchestrator socket")?;
                match msg {
                    Message::Text(text) => {
                        let frame: OrchestratorFrame = serde_json::from_str(&text)
                            .context("received malformed frame from orchestrator")?;
                        handle_orchestrator_frame(config, &mut ws, checkpoint_store, job, frame).await?;
                    }
                    Message::Close(_) => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

async fn next_job_event(job: &mut Option<RunningJob>) -> Option<TranscodeEvent> {
    match job {
        Some(j) => j.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_orchestrator_frame(
    config: &AgentConfig,
    ws: &mut Ws,
    checkpoint_store: &CheckpointStore,
    job: &mut Option<RunningJob>,
    frame: OrchestratorFrame,
) -> Result<()> {
    match frame {
        OrchestratorFrame::Assign { task } => start_job(config, ws, checkpoint_store, job, task).await,
        OrchestratorFrame::Cancel { task } => {
            if let Some(j) = job.as_ref() {
                if j.task_id == task.id {
                    j.cancel.cancel();
                }
            }
            Ok(())
        }
        OrchestratorFrame::Ping => {
            send_frame(ws, &AgentFrame::Heartbeat { agent_id: config.agent_id.clone() }).await
        }
        OrchestratorFrame::Acknowledge { message } => {
            debug!(message, "orchestrator acknowledged connect");
            Ok(())
        }
    }
}

async fn start_job(
    config: &AgentConfig,
    ws: &mut Ws,
    checkpoint_store: &CheckpointStore,
    job: &mut Option<RunningJob>,
    task: Task,
) -> Result<()> {
    if job.is_some() {
        warn!(task_id = %task.id, "received assign while another task is already running, ignoring");
        return Ok(());
    }

    let inputs = task.input_files_typed().context("task has malformed input_files")?;
    let output = task.output_settings_typed().context("task has malformed output_settings")?;

    let input_paths: Vec<PathBuf> = match inputs.iter().map(|r| config.storage_map.resolve(r)).collect() {
        Ok(paths) => paths,
        Err(e) => {
            return fail_without_starting(ws, &config.agent_id, task.id, &e.to_string()).await;
        }
    };
    let output_path = match config.storage_map.resolve(&transcast_db::models::StorageRef {
        storage_id: output.storage_id.clone(),
        path: output.path.clone(),
    }) {
        Ok(path) => path,
        Err(e) => {
            return fail_without_starting(ws, &config.agent_id, task.id, &e.to_string()).await;
        }
    };

    let checkpoint = Checkpoint {
        task_id: task.id,
        started_at: chrono::Utc::now(),
        progress: 0.0,
        owner_process_id: std::process::id(),
    };
    checkpoint_store.save(&checkpoint).context("failed to write checkpoint before starting job")?;

    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let output_spec = OutputSpec {
        path: output_path,
        codec: output.codec,
        resolution: output.resolution,
    };
    tokio::spawn(transcoder::run(task.id, input_paths, output_spec, cancel.clone(), tx));

    *job = Some(RunningJob {
        task_id: task.id,
        cancel,
        events: rx,
    });
    Ok(())
}

/// Report a failure for a task that never got as far as spawning `ffmpeg`
/// (an unresolvable storage reference). No checkpoint is written since no
/// job actually started.
async fn fail_without_starting(ws: &mut Ws, agent_id: &str, task_id: Uuid, error: &str) -> Result<()> {
    warn!(%task_id, error, "task failed before starting");
    send_frame(
        ws,
        &AgentFrame::Failed {
            agent_id: agent_id.to_string(),
            task_id,
            data: FailedData { error: error.to_string() },
        },
    )
    .await
}

async fn handle_job_event(
    ws: &mut Ws,
    agent_id: &str,
    checkpoint_store: &CheckpointStore,
    job: &mut Option<RunningJob>,
    event: TranscodeEvent,
) -> Result<()> {
    let Some(running) = job.as_ref() else { return Ok(()) };
    let task_id = running.task_id;

    match event {
        TranscodeEvent::Progress(progress) => {
            if let Some(mut cp) = checkpoint_store.load() {
                cp.progress = progress;
                if let Err(e) = checkpoint_store.save(&cp) {
                    warn!(%task_id, error = %e, "failed to update checkpoint progress");
                }
            }
            send_frame(
                ws,
                &AgentFrame::Progress {
                    agent_id: agent_id.to_string(),
                    task_id,
                    data: ProgressData { progress },
                },
            )
            .await
        }
        TranscodeEvent::Complete => {
            finish_job(job, checkpoint_store);
            send_frame(
                ws,
                &AgentFrame::Complete {
                    agent_id: agent_id.to_string(),
                    task_id,
                },
            )
            .await
        }
        TranscodeEvent::Error(error) => {
            finish_job(job, checkpoint_store);
            send_frame(
                ws,
                &AgentFrame::Failed {
                    agent_id: agent_id.to_string(),
                    task_id,
                    data: FailedData { error },
                },
            )
            .await
        }
    }
}

/// Clear the finished job's local state and its checkpoint.
fn finish_job(job: &mut Option<RunningJob>, checkpoint_store: &CheckpointStore) {
    *job = None;
    if let Err(e) = checkpoint_store.clear() {
        warn!(error = %e, "failed to clear checkpoint after job finished");
    }
}
