use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::util::ServiceExt;

mod common;
use common::{setup_test_app, setup_test_app_no_token_env, TEST_ENV, TEST_TOKEN};

#[tokio::test]
async fn verify_succeeds_with_correct_token() -> Result<(), Box<dyn std::error::Error>> {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/verify")
                .header("Content-Type", "application/json")
                .header("Authorization", TEST_TOKEN)
                .body(Body::from(serde_json::to_vec(&json!({ "env": TEST_ENV }))?))?,
        )
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn verify_rejects_missing_token() -> Result<(), Box<dyn std::error::Error>> {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/verify")
                .header("Content-Type", "application/json")
                .body(Body::from(serde_json::to_vec(&json!({ "env": TEST_ENV }))?))?,
        )
        .await?;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn verify_rejects_wrong_token() -> Result<(), Box<dyn std::error::Error>> {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/verify")
                .header("Content-Type", "application/json")
                .header("Authorization", "not-the-right-token")
                .body(Body::from(serde_json::to_vec(&json!({ "env": TEST_ENV }))?))?,
        )
        .await?;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn verify_rejects_unknown_environment() -> Result<(), Box<dyn std::error::Error>> {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/verify")
                .header("Content-Type", "application/json")
                .header("Authorization", TEST_TOKEN)
                .body(Body::from(serde_json::to_vec(&json!({ "env": "does-not-exist" }))?))?,
        )
        .await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn verify_rejects_missing_env() -> Result<(), Box<dyn std::error::Error>> {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/verify")
                .header("Content-Type", "application/json")
                .header("Authorization", TEST_TOKEN)
                .body(Body::from(serde_json::to_vec(&json!({}))?))?,
        )
        .await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn verify_rejects_environment_with_no_token_configured() -> Result<(), Box<dyn std::error::Error>> {
    let app = setup_test_app_no_token_env("untokened").await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/verify")
                .header("Content-Type", "application/json")
                .header("Authorization", "anything")
                .body(Body::from(serde_json::to_vec(&json!({ "env": "untokened" }))?))?,
        )
        .await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn ping_and_health_do_not_require_auth() -> Result<(), Box<dyn std::error::Error>> {
    let app = setup_test_app().await;

    let response =
        app.router.clone().oneshot(Request::builder().method("GET").uri("/ping").body(Body::empty())?).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.router.oneshot(Request::builder().method("GET").uri("/health").body(Body::empty())?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}
