use super::AppState;
use crate::auth;
use crate::error::Result;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub async fn ping() -> &'static str {
    "pong"
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    uptime: u64,
    version: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now(),
    })
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    env: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    success: bool,
    env: String,
}

pub async fn verify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>> {
    let token = auth::extract_token(&headers);
    let env_config = auth::validate(&state.config, req.env.as_deref(), token.as_deref())?;
    let _ = env_config;

    Ok(Json(VerifyResponse {
        success: true,
        env: req.env.unwrap_or_default(),
    }))
}
