use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use sha2::Digest;
use tower::util::ServiceExt;

mod common;
use common::{setup_test_app, TEST_ENV, TEST_TOKEN};

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn full_chunked_upload_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
    let app = setup_test_app().await;
    let data = b"a".repeat(25);
    let chunks: Vec<&[u8]> = vec![&data[0..10], &data[10..20], &data[20..25]];

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/upload/init")
                .header("Content-Type", "application/json")
                .header("Authorization", TEST_TOKEN)
                .body(Body::from(serde_json::to_vec(&json!({
                    "uploadId": "0123456789abcdef0123456789abcdef",
                    "totalChunks": chunks.len(),
                    "fileName": "artifact.bin",
                    "shouldExtract": false,
                    "env": TEST_ENV,
                }))?))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let init = body_json(response).await;
    assert_eq!(init["isResume"], false);
    assert!(init["uploadedChunks"].as_array().unwrap().is_empty());

    for (index, chunk) in chunks.iter().enumerate() {
        let md5_hex = format!("{:x}", md5::compute(chunk));
        let response = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/upload/chunk?uploadId=0123456789abcdef0123456789abcdef&chunkIndex={index}&env={TEST_ENV}"))
                    .header("Authorization", TEST_TOKEN)
                    .header("X-Chunk-MD5", md5_hex)
                    .body(Body::from(chunk.to_vec()))?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let checksum = format!("{:x}", sha2::Sha256::digest(&data));
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/upload/complete")
                .header("Content-Type", "application/json")
                .header("Authorization", TEST_TOKEN)
                .body(Body::from(serde_json::to_vec(&json!({
                    "uploadId": "0123456789abcdef0123456789abcdef",
                    "fileName": "artifact.bin",
                    "checksum": checksum,
                    "shouldExtract": false,
                    "env": TEST_ENV,
                }))?))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let complete = body_json(response).await;
    assert_eq!(complete["checksumVerified"], true);
    assert_eq!(complete["extracted"], false);

    let written = std::fs::read(app.upload_path.join("artifact.bin"))?;
    assert_eq!(written, data);
    Ok(())
}

#[tokio::test]
async fn chunk_md5_mismatch_returns_bad_request() -> Result<(), Box<dyn std::error::Error>> {
    let app = setup_test_app().await;

    app.router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/upload/init")
                .header("Content-Type", "application/json")
                .header("Authorization", TEST_TOKEN)
                .body(Body::from(serde_json::to_vec(&json!({
                    "uploadId": "deadbeefdeadbeefdeadbeefdeadbeef",
                    "totalChunks": 1,
                    "fileName": "x.bin",
                    "shouldExtract": false,
                    "env": TEST_ENV,
                }))?))?,
        )
        .await?;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/upload/chunk?uploadId=deadbeefdeadbeefdeadbeefdeadbeef&chunkIndex=0&env={TEST_ENV}"))
                .header("Authorization", TEST_TOKEN)
                .header("X-Chunk-MD5", "0000000000000000000000000000000")
                .body(Body::from(b"payload".to_vec()))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn status_reports_uploaded_chunks() -> Result<(), Box<dyn std::error::Error>> {
    let app = setup_test_app().await;

    app.router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/upload/init")
                .header("Content-Type", "application/json")
                .header("Authorization", TEST_TOKEN)
                .body(Body::from(serde_json::to_vec(&json!({
                    "uploadId": "statususeonly0000000000000000000",
                    "totalChunks": 2,
                    "fileName": "x.bin",
                    "shouldExtract": false,
                    "env": TEST_ENV,
                }))?))?,
        )
        .await?;

    app.router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/upload/chunk?uploadId=statususeonly0000000000000000000&chunkIndex=0&env={TEST_ENV}"))
                .header("Authorization", TEST_TOKEN)
                .body(Body::from(b"aa".to_vec()))?,
        )
        .await?;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/upload/status?uploadId=statususeonly0000000000000000000&env={TEST_ENV}"))
                .header("Authorization", TEST_TOKEN)
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let status = body_json(response).await;
    assert_eq!(status["exists"], true);
    assert_eq!(status["uploadedChunks"], json!([0]));

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/upload/cancel?uploadId=statususeonly0000000000000000000&env={TEST_ENV}"))
                .header("Authorization", TEST_TOKEN)
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn small_file_upload_via_multipart() -> Result<(), Box<dyn std::error::Error>> {
    let app = setup_test_app().await;

    let boundary = "----fde-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"env\"\r\n\r\n");
    body.extend_from_slice(TEST_ENV.as_bytes());
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"file\"; filename=\"small.txt\"\r\n");
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(b"small file contents");
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/upload")
                .header("Content-Type", format!("multipart/form-data; boundary={boundary}"))
                .header("Authorization", TEST_TOKEN)
                .body(Body::from(body))?,
        )
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    let result = body_json(response).await;
    assert_eq!(result["fileName"], "small.txt");
    assert_eq!(result["extracted"], false);
    Ok(())
}
