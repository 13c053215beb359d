//! SSE framing and the two live-stream/resume-stream pumps.
//!
//! The fresh-deploy pump and the resume pump are independent producers: one
//! drives the process directly and emits as it goes, the other tails the
//! shared buffer by id. Both write into an mpsc channel consumed by axum's
//! `Sse` body, so a slow or dropped client never blocks the deploy itself.

use super::executor::PreparedCommand;
use super::{DeployEntry, DeployResult, EventKind, EventRecord};
use axum::response::sse::Event;
use chrono::Utc;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

type SseItem = std::result::Result<Event, Infallible>;

const RESUME_POLL_MS: u64 = 100;
const CHANNEL_CAPACITY: usize = 256;

fn to_sse_event(record: &EventRecord) -> Event {
    Event::default()
        .id(record.id.to_string())
        .event(record.event.as_str())
        .data(record.data.to_string())
}

/// Start a fresh deploy and stream its output live. Also populates the
/// shared buffer so any concurrent resume connections see the same events.
pub fn fresh_stream(entry: Arc<DeployEntry>, prepared: PreparedCommand) -> impl Stream<Item = SseItem> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(run_and_emit(entry, prepared, tx));
    ReceiverStream::new(rx)
}

/// Resume watching an in-progress or just-finished deploy from `last_event_id`.
pub fn resume_stream(entry: Arc<DeployEntry>, last_event_id: u64) -> impl Stream<Item = SseItem> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(resume_and_emit(entry, last_event_id, tx));
    ReceiverStream::new(rx)
}

async fn append_and_emit(
    entry: &DeployEntry,
    tx: &mpsc::Sender<SseItem>,
    kind: EventKind,
    data: serde_json::Value,
) {
    let record = {
        let mut state = entry.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;
        let record = EventRecord { id, event: kind, data };
        state.output_buffer.push(record.clone());
        record
    };
    entry.notify.notify_waiters();
    let _ = tx.send(Ok(to_sse_event(&record))).await;
}

async fn finalize(entry: &DeployEntry, success: bool, exit_code: i32) {
    let mut state = entry.state.lock().await;
    let start_time = state.start_time.unwrap_or_else(Utc::now);
    state.last_result = Some(DeployResult {
        success,
        start_time,
        end_time: Utc::now(),
        exit_code,
    });
    state.running = false;
    state.output_buffer.clear();
    drop(state);
    entry.notify.notify_waiters();
}

async fn run_and_emit(entry: Arc<DeployEntry>, prepared: PreparedCommand, tx: mpsc::Sender<SseItem>) {
    let mut cmd = Command::new(&prepared.program);
    cmd.args(&prepared.args)
        .current_dir(&prepared.cwd)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            append_and_emit(
                &entry,
                &tx,
                EventKind::Error,
                serde_json::json!({ "error": format!("failed to spawn deploy command: {e}") }),
            )
            .await;
            finalize(&entry, false, -1).await;
            return;
        }
    };

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let (line_tx, mut line_rx) = mpsc::channel::<(&'static str, String)>(256);

    let out_tx = line_tx.clone();
    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if out_tx.send(("stdout", line)).await.is_err() {
                break;
            }
        }
    });

    let err_tx = line_tx.clone();
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if err_tx.send(("stderr", line)).await.is_err() {
                break;
            }
        }
    });
    drop(line_tx);

    let drain_entry = Arc::clone(&entry);
    let drain_tx = tx.clone();
    let drain_task = tokio::spawn(async move {
        let mut stdout_acc = String::new();
        let mut stderr_acc = String::new();
        while let Some((stream, line)) = line_rx.recv().await {
            let line_with_newline = format!("{line}\n");
            match stream {
                "stdout" => stdout_acc.push_str(&line_with_newline),
                "stderr" => stderr_acc.push_str(&line_with_newline),
                _ => {}
            }
            append_and_emit(
                &drain_entry,
                &drain_tx,
                EventKind::Output,
                serde_json::json!({ "type": stream, "data": line_with_newline }),
            )
            .await;
        }
        (stdout_acc, stderr_acc)
    });

    let status = child.wait().await;
    let _ = stdout_task.await;
    let _ = stderr_task.await;
    let (stdout_acc, stderr_acc) = drain_task.await.unwrap_or_default();

    let (success, exit_code) = match status {
        Ok(status) => (status.success(), status.code().unwrap_or(-1)),
        Err(_) => (false, -1),
    };

    let data = if success {
        serde_json::json!({ "success": true, "exitCode": exit_code })
    } else {
        serde_json::json!({ "exitCode": exit_code, "stdout": stdout_acc, "stderr": stderr_acc })
    };
    append_and_emit(&entry, &tx, if success { EventKind::Done } else { EventKind::Error }, data).await;

    finalize(&entry, success, exit_code).await;
}

fn synth_terminal_event(id: u64, result: &DeployResult) -> EventRecord {
    let kind = if result.success { EventKind::Done } else { EventKind::Error };
    let data = if result.success {
        serde_json::json!({ "success": true, "exitCode": result.exit_code })
    } else {
        serde_json::json!({ "exitCode": result.exit_code })
    };
    EventRecord { id, event: kind, data }
}

async fn resume_and_emit(entry: Arc<DeployEntry>, mut last_id: u64, tx: mpsc::Sender<SseItem>) {
    let mut delivered_terminal = false;

    loop {
        let (new_events, running) = {
            let state = entry.state.lock().await;
            let events: Vec<EventRecord> = state
                .output_buffer
                .iter()
                .filter(|e| e.id > last_id)
                .cloned()
                .collect();
            (events, state.running)
        };

        for record in new_events {
            last_id = record.id;
            if matches!(record.event, EventKind::Done | EventKind::Error) {
                delivered_terminal = true;
            }
            if tx.send(Ok(to_sse_event(&record))).await.is_err() {
                return;
            }
        }

        if !running {
            break;
        }

        tokio::select! {
            _ = entry.notify.notified() => {}
            _ = tokio::time::sleep(Duration::from_millis(RESUME_POLL_MS)) => {}
        }
    }

    if delivered_terminal {
        return;
    }

    let last_result = entry.state.lock().await.last_result.clone();
    let record = match last_result {
        Some(result) => synth_terminal_event(last_id + 1, &result),
        None => EventRecord {
            id: last_id + 1,
            event: EventKind::Error,
            data: serde_json::json!({ "error": "No deployment in progress" }),
        },
    };
    let _ = tx.send(Ok(to_sse_event(&record))).await;
}
