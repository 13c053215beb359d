//! HTTP handlers for the deploy executor and its SSE state machine.

use super::AppState;
use crate::auth;
use crate::deploy::{executor, sse, status_snapshot, try_start, DeployResult};
use crate::error::{Error, Result};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    env: Option<String>,
    #[serde(default)]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct SyncDeployResponse {
    success: bool,
    stdout: String,
    stderr: String,
}

pub async fn deploy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<DeployRequest>,
) -> Result<axum::response::Response> {
    let token = auth::extract_token(&headers);
    let env_config = auth::validate(&state.config, req.env.as_deref(), token.as_deref())?;
    let env_name = req.env.clone().unwrap_or_default();

    let deploy_command = env_config
        .deploy_command
        .clone()
        .ok_or_else(|| Error::Config { msg: "deployCommand not configured".to_string() })?;
    let upload_path = env_config
        .upload_path
        .clone()
        .ok_or_else(|| Error::Config { msg: "uploadPath not configured".to_string() })?;
    let upload_path = state.path_ctx.resolve_data_path(&upload_path);

    let prepared = executor::prepare(&state.path_ctx, &deploy_command, &upload_path)?;

    if !req.stream {
        let result = executor::run_sync(&prepared).await;
        return match result {
            Ok(output) => Ok(Json(SyncDeployResponse {
                success: true,
                stdout: output.stdout,
                stderr: output.stderr,
            })
            .into_response()),
            Err(Error::ExecutionFailed { exit_code, stdout, stderr }) => {
                Ok((
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({
                        "error": format!("deploy command exited with status {exit_code}"),
                        "stdout": stdout,
                        "stderr": stderr,
                        "exitCode": exit_code,
                    })),
                )
                    .into_response())
            }
            Err(e) => Err(e),
        };
    }

    let entry = state.deploy_store.entry(&env_name).await;
    let last_event_id = headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());

    let stream: std::pin::Pin<Box<dyn tokio_stream::Stream<Item = std::result::Result<Event, Infallible>> + Send>> =
        if let Some(last_id) = last_event_id {
            Box::pin(sse::resume_stream(entry, last_id))
        } else {
            try_start(&entry).await?;
            Box::pin(sse::fresh_stream(entry, prepared))
        };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    env: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    env: String,
    running: bool,
    #[serde(rename = "startTime", skip_serializing_if = "Option::is_none")]
    start_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "bufferedCount")]
    buffered_count: usize,
    #[serde(rename = "lastResult", skip_serializing_if = "Option::is_none")]
    last_result: Option<DeployResult>,
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>> {
    let token = auth::extract_token(&headers);
    auth::validate(&state.config, query.env.as_deref(), token.as_deref())?;
    let env_name = query.env.unwrap_or_default();

    let entry = state.deploy_store.entry(&env_name).await;
    let snapshot = status_snapshot(&entry).await;

    Ok(Json(StatusResponse {
        env: env_name,
        running: snapshot.running,
        start_time: snapshot.start_time,
        buffered_count: snapshot.buffered_count,
        last_result: snapshot.last_result,
    }))
}
