//! Transcoder harness: drives `ffprobe`/`ffmpeg` child processes, parses
//! machine-readable progress, and rate-limits callbacks.
//!
//! Modeled as an async job reporting through a channel rather than boxed
//! callbacks -- `tokio::sync::mpsc` is the idiom this workspace already
//! uses to get results out of a spawned task.
//! Exactly one [`TranscodeEvent::Complete`] or [`TranscodeEvent::Error`]
//! is sent per run.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Desired output encoding, resolved from a task's `output_settings`.
#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub path: PathBuf,
    pub codec: String,
    pub resolution: String,
}

/// Terminal/progress events emitted by a transcode run.
#[derive(Debug, Clone)]
pub enum TranscodeEvent {
    /// `progress` is in `[0, 100)`; never 100 (implicit on completion).
    Progress(f64),
    Complete,
    Error(String),
}

struct StreamInfo {
    has_video: bool,
    has_audio: bool,
    duration_secs: f64,
}

/// Probe one input file for video/audio stream presence and duration,
/// via two `ffprobe` invocations (`-select_streams v:0` / `a:0`).
async fn probe_input(path: &Path) -> Result<StreamInfo> {
    let video = probe_stream(path, "v:0").await?;
    let audio = probe_stream(path, "a:0").await?;

    Ok(StreamInfo {
        has_video: video.is_some(),
        has_audio: audio.is_some(),
        duration_secs: video.unwrap_or(0.0) + audio.unwrap_or(0.0),
    })
}

/// Returns `Some(duration)` if the selected stream exists, `None` if it
/// doesn't (ffprobe emits no entries for an absent stream selector).
async fn probe_stream(path: &Path, selector: &str) -> Result<Option<f64>> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            selector,
            "-show_entries",
            "stream=codec_type,duration",
            "-of",
            "json",
        ])
        .arg(path)
        .output()
        .await
        .context("failed to spawn ffprobe")?;

    if !output.status.success() {
        // ffprobe exits non-zero for genuinely unreadable files; treat as
        // "stream absent" here, the caller's input-existence check already
        // ran first.
        return Ok(None);
    }

    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).context("failed to parse ffprobe json output")?;

    let streams = parsed.get("streams").and_then(|s| s.as_array());
    let Some(streams) = streams else {
        return Ok(None);
    };
    let Some(stream) = streams.first() else {
        return Ok(None);
    };

    let duration = stream
        .get("duration")
        .and_then(|d| d.as_str())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(Some(duration))
}

fn codec_args(codec: &str) -> Result<Vec<&'static str>> {
    Ok(match codec {
        "h264" => vec!["-c:v", "libx264", "-preset", "medium"],
        "h265" => vec!["-c:v", "libx265", "-preset", "medium"],
        "vp9" => vec!["-c:v", "libvpx-vp9"],
        other => bail!("unsupported codec: {other}"),
    })
}

fn parse_resolution(resolution: &str) -> Result<(u32, u32)> {
    let (w, h) = resolution
        .split_once('x')
        .with_context(|| format!("malformed resolution {resolution:?}, expected WxH"))?;
    Ok((
        w.parse().context("invalid width in resolution")?,
        h.parse().context("invalid height in resolution")?,
    ))
}

/// Build the `ffmpeg` argv for this input set / output spec.
fn build_ffmpeg_args(inputs: &[(PathBuf, StreamInfo)], output: &OutputSpec) -> Result<Vec<String>> {
    let mut args: Vec<String> = Vec::new();

    for (path, _) in inputs {
        args.push("-i".into());
        args.push(path.to_string_lossy().into_owned());
    }

    if inputs.len() == 1 {
        let (_, info) = &inputs[0];
        if info.has_video {
            args.push("-map".into());
            args.push("0:v".into());
        }
        if info.has_audio {
            args.push("-map".into());
            args.push("0:a".into());
        }
        args.push("-s".into());
        args.push(output.resolution.clone());
    } else {
        let (w, h) = parse_resolution(&output.resolution)?;
        let mut video_labels = Vec::new();
        let mut filter_parts = Vec::new();

        for (idx, (_, info)) in inputs.iter().enumerate() {
            if info.has_video {
                filter_parts.push(format!(
                    "[{idx}:v]scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps=30,format=yuv420p[v{idx}]"
                ));
                video_labels.push(format!("[v{idx}]"));
            }
        }

        let audio_labels: Vec<String> = inputs
            .iter()
            .enumerate()
            .filter(|(_, (_, info))| info.has_audio)
            .map(|(idx, _)| format!("[{idx}:a]"))
            .collect();

        let n = inputs.len();
        filter_parts.push(format!(
            "{}concat=n={n}:v=1:a=0[vout]",
            video_labels.join("")
        ));
        if !audio_labels.is_empty() {
            filter_parts.push(format!(
                "{}concat=n={}:v=0:a=1[aout]",
                audio_labels.join(""),
                audio_labels.len()
            ));
        }

        args.push("-filter_complex".into());
        args.push(filter_parts.join(";"));
        args.push("-map".into());
        args.push("[vout]".into());
        if !audio_labels.is_empty() {
            args.push("-map".into());
            args.push("[aout]".into());
        }
    }

    for a in codec_args(&output.codec)? {
        args.push(a.to_string());
    }
    if inputs.iter().any(|(_, info)| info.has_audio) {
        args.push("-c:a".into());
        args.push("aac".into());
    }

    args.push("-progress".into());
    args.push("pipe:1".into());
    args.push("-stats".into());
    args.push("-y".into());
    args.push(output.path.to_string_lossy().into_owned());

    Ok(args)
}

/// Run a transcode job to completion, emitting progress/terminal events
/// on `events`. Returns once the terminal event has been sent.
pub async fn run(
    task_id: uuid::Uuid,
    input_paths: Vec<PathBuf>,
    output: OutputSpec,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<TranscodeEvent>,
) {
    if let Err(e) = run_inner(input_paths, output, cancel, &events).await {
        debug!(%task_id, error = %e, "transcode job failed");
        let _ = events.send(TranscodeEvent::Error(e.to_string()));
    }
}

async fn run_inner(
    input_paths: Vec<PathBuf>,
    output: OutputSpec,
    cancel: CancellationToken,
    events: &mpsc::UnboundedSender<TranscodeEvent>,
) -> Result<()> {
    for path in &input_paths {
        if !path.exists() {
            bail!("input file does not exist: {}", path.display());
        }
    }

    let mut total_duration = 0.0;
    let mut inputs = Vec::with_capacity(input_paths.len());
    for path in input_paths {
        let info = probe_input(&path).await?;
        total_duration += info.duration_secs;
        inputs.push((path, info));
    }
    if total_duration <= 0.0 {
        total_duration = 1.0;
    }

    let args = build_ffmpeg_args(&inputs, &output)?;

    let mut child = Command::new("ffmpeg")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to spawn ffmpeg")?;

    let stdout = child.stdout.take().context("ffmpeg child has no stdout")?;
    let stderr = child.stderr.take().context("ffmpeg child has no stderr")?;

    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.to_ascii_lowercase().contains("error") {
                warn!(ffmpeg_stderr = %line, "ffmpeg reported an error line");
            } else {
                debug!(ffmpeg_stderr = %line);
            }
        }
    });

    let mut last_emitted = 0.0;
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                child.start_kill().context("failed to send SIGTERM to ffmpeg")?;
                let _ = child.wait().await;
                let _ = stderr_task.await;
                events.send(TranscodeEvent::Error("transcode cancelled".into())).ok();
                return Ok(());
            }

            line = lines.next_line() => {
                match line.context("failed to read ffmpeg progress output")? {
                    Some(line) => {
                        if let Some(ms) = line.strip_prefix("out_time_ms=").and_then(|v| v.trim().parse::<i64>().ok()) {
                            let seconds = ms as f64 / 1_000_000.0;
                            let progress = (seconds / total_duration * 100.0).min(99.9);
                            if progress - last_emitted >= 1.0 {
                                last_emitted = progress;
                                events.send(TranscodeEvent::Progress(progress)).ok();
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let status = child.wait().await.context("failed to wait for ffmpeg")?;
    let _ = stderr_task.await;

    if status.success() {
        events.send(TranscodeEvent::Complete).ok();
        Ok(())
    } else {
        let code = status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string());
        bail!("ffmpeg exited with code {code}")
    }
}
