pub mod deploy;
pub mod misc;
pub mod upload;

use crate::config::Config;
use crate::deploy::DeployStore;
use crate::path::PathContext;
use crate::upload::UploadStore;
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub config: Config,
    pub path_ctx: PathContext,
    pub upload_store: UploadStore,
    pub deploy_store: DeployStore,
    pub started_at: Instant,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(misc::ping))
        .route("/health", get(misc::health))
        .route("/verify", post(misc::verify))
        .route("/upload", post(upload::upload_small))
        .route("/upload/init", post(upload::init))
        .route("/upload/chunk", post(upload::chunk))
        .route("/upload/complete", post(upload::complete))
        .route("/upload/status", get(upload::status))
        .route("/upload/cancel", delete(upload::cancel))
        .route("/deploy", post(deploy::deploy))
        .route("/deploy/status", get(deploy::status))
        .with_state(state)
}
