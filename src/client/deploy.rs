//! Deploy client: consumes the `/deploy` SSE stream and reconnects with
//! `Last-Event-ID` if the connection drops mid-stream.

use super::{http_client, map_reqwest_err, Connection};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_RECONNECTS: u32 = 5;

#[derive(Debug, Clone)]
pub enum DeployEvent {
    Output { stream: String, data: String },
    Done { exit_code: i32 },
    Error { message: String, exit_code: Option<i32> },
}

#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub success: bool,
    pub exit_code: i32,
}

#[derive(Debug, Serialize)]
struct DeployRequest<'a> {
    env: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OutputPayload {
    #[serde(rename = "type")]
    stream: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct DonePayload {
    #[serde(rename = "exitCode")]
    exit_code: i32,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    error: Option<String>,
    #[serde(default, rename = "exitCode")]
    exit_code: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    running: bool,
    #[serde(rename = "lastResult")]
    last_result: Option<LastResult>,
}

#[derive(Debug, Deserialize)]
struct LastResult {
    success: bool,
    #[serde(rename = "exitCode")]
    exit_code: i32,
}

pub struct DeployClient {
    http: reqwest::Client,
    conn: Connection,
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    error: Option<String>,
}

impl DeployClient {
    pub fn new(conn: Connection) -> Self {
        Self { http: http_client(), conn }
    }

    /// Runs the deploy command and waits for it to finish without streaming;
    /// the server runs it synchronously and returns the full output in one
    /// response.
    pub async fn run_sync(&self) -> Result<SyncOutcome> {
        let response = self
            .http
            .post(self.conn.url("/deploy"))
            .header("Authorization", &self.conn.token)
            .json(&DeployRequest { env: &self.conn.env, stream: false })
            .send()
            .await
            .map_err(map_reqwest_err)?;

        let status = response.status();
        let body: SyncResponse = response.json().await.map_err(map_reqwest_err)?;

        if status.is_success() {
            Ok(SyncOutcome { success: true, stdout: body.stdout, stderr: body.stderr })
        } else {
            Ok(SyncOutcome {
                success: false,
                stdout: body.stdout,
                stderr: body.error.unwrap_or(body.stderr),
            })
        }
    }

    /// Drives a full deploy to completion, calling `on_event` for every
    /// output/done/error frame observed, across however many reconnects it
    /// takes. Falls back to polling `/deploy/status` if the stream keeps
    /// dropping.
    pub async fn run(&self, mut on_event: impl FnMut(&DeployEvent)) -> Result<DeployOutcome> {
        let mut last_id: Option<u64> = None;
        let mut reconnects: u32 = 0;

        loop {
            match self.stream_once(last_id, &mut last_id, &mut on_event).await {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, reconnects, "deploy stream dropped"),
            }

            reconnects += 1;
            if reconnects > MAX_RECONNECTS {
                tracing::warn!("exhausted reconnect attempts, falling back to status poll");
                return self.fetch_status().await;
            }
            let backoff_ms = (500u64.saturating_mul(1u64 << reconnects.min(5))).min(8_000);
            let jitter_ms = rand::random::<u64>() % 500;
            tokio::time::sleep(Duration::from_millis(backoff_ms + jitter_ms)).await;
        }
    }

    /// Opens one SSE connection and reads it until either a terminal event
    /// arrives (`Ok(Some(outcome))`) or the stream ends early (`Ok(None)`,
    /// triggering a reconnect as a resume).
    async fn stream_once(
        &self,
        last_id: Option<u64>,
        last_id_out: &mut Option<u64>,
        on_event: &mut impl FnMut(&DeployEvent),
    ) -> Result<Option<DeployOutcome>> {
        let mut request = self
            .http
            .post(self.conn.url("/deploy"))
            .header("Authorization", &self.conn.token)
            .json(&DeployRequest { env: &self.conn.env, stream: true });
        if let Some(id) = last_id {
            request = request.header("Last-Event-ID", id.to_string());
        }

        let response = request.send().await.map_err(map_reqwest_err)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ExecutionFailed { exit_code: status.as_u16() as i32, stdout: String::new(), stderr: body });
        }

        let mut stream = response.bytes_stream();
        let mut buf = String::new();

        use tokio_stream::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_err)?;
            buf.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buf.find("\n\n") {
                let frame = buf[..pos].to_string();
                buf.drain(..pos + 2);

                if let Some((id, event_name, data)) = parse_frame(&frame) {
                    *last_id_out = Some(id);
                    if let Some(outcome) = dispatch_frame(&event_name, &data, on_event) {
                        return Ok(Some(outcome));
                    }
                }
            }
        }

        Ok(None)
    }

    async fn fetch_status(&self) -> Result<DeployOutcome> {
        let response = self
            .http
            .get(self.conn.url("/deploy/status"))
            .query(&[("env", self.conn.env.as_str())])
            .header("Authorization", &self.conn.token)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let status: StatusResponse = response.json().await.map_err(map_reqwest_err)?;

        match status.last_result {
            Some(result) => Ok(DeployOutcome { success: result.success, exit_code: result.exit_code }),
            None if status.running => {
                Err(Error::Conflict { reason: "deploy is still running after losing the event stream".to_string() })
            }
            None => Err(Error::Conflict { reason: "no deploy result available".to_string() }),
        }
    }
}

fn parse_frame(frame: &str) -> Option<(u64, String, String)> {
    let mut id = None;
    let mut event_name = None;
    let mut data = String::new();

    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("id: ") {
            id = rest.trim().parse::<u64>().ok();
        } else if let Some(rest) = line.strip_prefix("event: ") {
            event_name = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data: ") {
            data = rest.to_string();
        }
    }

    Some((id?, event_name?, data))
}

fn dispatch_frame(event_name: &str, data: &str, on_event: &mut impl FnMut(&DeployEvent)) -> Option<DeployOutcome> {
    match event_name {
        "output" => {
            let payload: OutputPayload = serde_json::from_str(data).ok()?;
            on_event(&DeployEvent::Output { stream: payload.stream, data: payload.data });
            None
        }
        "done" => {
            let payload: DonePayload = serde_json::from_str(data).ok()?;
            on_event(&DeployEvent::Done { exit_code: payload.exit_code });
            Some(DeployOutcome { success: payload.exit_code == 0, exit_code: payload.exit_code })
        }
        "error" => {
            let payload: ErrorPayload = serde_json::from_str(data).unwrap_or(ErrorPayload { error: None, exit_code: None });
            let message = payload.error.clone().unwrap_or_else(|| format!("deploy command exited with status {}", payload.exit_code.unwrap_or(-1)));
            on_event(&DeployEvent::Error { message, exit_code: payload.exit_code });
            Some(DeployOutcome { success: false, exit_code: payload.exit_code.unwrap_or(1) })
        }
        _ => None,
    }
}
