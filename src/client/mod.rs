//! HTTP client side: chunked upload and deploy-trigger with SSE reconnect.
//!
//! Mirrors the server's wire contract exactly; nothing here is shared code
//! with the server beyond the error type.

pub mod deploy;
pub mod upload;

use crate::error::{Error, Result};
use std::time::Duration;

/// Connect timeout applied to every client, including long-running ones
/// (chunk uploads, the deploy SSE stream); those still need a bounded
/// connect phase even though their bodies can legitimately run for a while.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Full request timeout for short, bounded endpoints (ping, health, verify).
const SHORT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for long-running operations: bounded connect phase, unbounded
/// response (chunk bodies and SSE streams can take much longer than 10s).
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .expect("failed to build reqwest client")
}

/// Client for short endpoints (ping/health), per the client-side timeout
/// requirement for those routes.
pub fn short_lived_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(SHORT_REQUEST_TIMEOUT)
        .build()
        .expect("failed to build reqwest client")
}

/// Shared connection details for one environment, resolved the same way the
/// server resolves its own config (env-level falls back to top-level).
#[derive(Debug, Clone)]
pub struct Connection {
    pub server_url: String,
    pub token: String,
    pub env: String,
}

impl Connection {
    pub fn auth_header(&self) -> (&'static str, String) {
        ("Authorization", self.token.clone())
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), path)
    }
}

pub(crate) fn map_reqwest_err(e: reqwest::Error) -> Error {
    Error::Io {
        error: std::io::Error::other(e.to_string()),
        path: e.url().map(|u| u.to_string()).unwrap_or_default(),
    }
}

pub(crate) async fn error_for_status_with_body(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(Error::ExecutionFailed {
        exit_code: status.as_u16() as i32,
        stdout: String::new(),
        stderr: body,
    })
}
