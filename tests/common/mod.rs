use axum::Router;
use fde::api::AppState;
use fde::config::{Config, EnvironmentConfig, ServerConfig};
use fde::deploy::DeployStore;
use fde::path::PathContext;
use fde::upload::UploadStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;

pub const TEST_ENV: &str = "test";
pub const TEST_TOKEN: &str = "test-token-abc123";

/// A router wired the same way the server wires it, backed by throwaway
/// upload-scratch and upload-target directories. Keeping the `TempDir`s
/// around for the struct's lifetime is what keeps the directories alive for
/// the duration of a test.
pub struct TestApp {
    pub router: Router,
    pub upload_path: std::path::PathBuf,
    _upload_root: TempDir,
    _target: TempDir,
}

pub async fn setup_test_app() -> TestApp {
    setup_test_app_with_command("echo deployed").await
}

/// Same wiring as `setup_test_app`, but with a caller-chosen deploy command —
/// useful for tests that need the run to still be in flight when a second
/// request lands.
pub async fn setup_test_app_with_command(command: &str) -> TestApp {
    let upload_root = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let upload_path = target.path().to_path_buf();

    let mut environments = HashMap::new();
    environments.insert(
        TEST_ENV.to_string(),
        EnvironmentConfig {
            token: Some(TEST_TOKEN.to_string()),
            upload_path: Some(upload_path.clone()),
            deploy_command: Some(command.to_string()),
            ..Default::default()
        },
    );

    let config = Config {
        server: ServerConfig::default(),
        token: None,
        server_url: None,
        environments,
    };

    let path_ctx = PathContext::from_env(target.path().to_path_buf()).unwrap();
    let upload_store = UploadStore::new(upload_root.path().to_path_buf());
    let deploy_store = DeployStore::new();

    let state = Arc::new(AppState {
        config,
        path_ctx,
        upload_store,
        deploy_store,
        started_at: Instant::now(),
    });

    TestApp {
        router: fde::api::build_router(state),
        upload_path,
        _upload_root: upload_root,
        _target: target,
    }
}

/// Builds an app with a second environment that has no token fallback at
/// all, to exercise the "no token configured" branch of the validator.
pub async fn setup_test_app_no_token_env(env_name: &str) -> TestApp {
    let upload_root = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let upload_path = target.path().to_path_buf();

    let mut environments = HashMap::new();
    environments.insert(
        env_name.to_string(),
        EnvironmentConfig { upload_path: Some(upload_path.clone()), ..Default::default() },
    );

    let config = Config { server: ServerConfig::default(), token: None, server_url: None, environments };

    let path_ctx = PathContext::from_env(target.path().to_path_buf()).unwrap();
    let upload_store = UploadStore::new(upload_root.path().to_path_buf());
    let deploy_store = DeployStore::new();

    let state = Arc::new(AppState {
        config,
        path_ctx,
        upload_store,
        deploy_store,
        started_at: Instant::now(),
    });

    TestApp {
        router: fde::api::build_router(state),
        upload_path,
        _upload_root: upload_root,
        _target: target,
    }
}
