//! HTTP handlers for the chunked and small-file upload endpoints.

use super::AppState;
use crate::auth;
use crate::error::{Error, Result};
use axum::extract::{Multipart, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

fn auth_headers<'a>(
    state: &'a AppState,
    headers: &HeaderMap,
    env: Option<&str>,
) -> Result<&'a crate::config::EnvironmentConfig> {
    let token = auth::extract_token(headers);
    auth::validate(&state.config, env, token.as_deref())
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    #[serde(rename = "fileName")]
    file_name: String,
    #[serde(rename = "fileSize")]
    file_size: u64,
    #[serde(rename = "checksumVerified")]
    checksum_verified: bool,
    extracted: bool,
    #[serde(rename = "uploadPath")]
    upload_path: String,
}

/// Small-file alternative to the chunked flow: the whole file arrives in one
/// multipart request.
pub async fn upload_small(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>> {
    let mut env: Option<String> = None;
    let mut checksum: Option<String> = None;
    let mut should_extract = false;
    let mut file_name: Option<String> = None;
    let mut temp_file: Option<NamedTempFile> = None;
    let mut hasher = sha2::Sha256::new();
    let mut file_size: u64 = 0;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::BadRequest { msg: format!("invalid multipart body: {e}") })?
    {
        match field.name().unwrap_or_default() {
            "env" => {
                env = Some(field.text().await.map_err(|e| Error::BadRequest {
                    msg: format!("invalid env field: {e}"),
                })?);
            }
            "checksum" => {
                checksum = Some(field.text().await.map_err(|e| Error::BadRequest {
                    msg: format!("invalid checksum field: {e}"),
                })?);
            }
            "shouldExtract" => {
                let value = field.text().await.map_err(|e| Error::BadRequest {
                    msg: format!("invalid shouldExtract field: {e}"),
                })?;
                should_extract = value == "true" || value == "1";
            }
            "file" => {
                file_name = field.file_name().map(|s| s.to_string());
                let tmp = NamedTempFile::new().map_err(|e| Error::Io {
                    error: e,
                    path: "<tmp upload file>".to_string(),
                })?;
                let mut out = tokio::fs::File::create(tmp.path()).await.map_err(|e| Error::Io {
                    error: e,
                    path: tmp.path().display().to_string(),
                })?;

                let data = field.bytes().await.map_err(|e| Error::BadRequest {
                    msg: format!("failed to read uploaded file: {e}"),
                })?;
                hasher.update(&data);
                file_size += data.len() as u64;
                out.write_all(&data).await.map_err(|e| Error::Io {
                    error: e,
                    path: tmp.path().display().to_string(),
                })?;
                out.sync_all().await.map_err(|e| Error::Io {
                    error: e,
                    path: tmp.path().display().to_string(),
                })?;

                temp_file = Some(tmp);
            }
            _ => {}
        }
    }

    let env_config = auth_headers(&state, &headers, env.as_deref())?;
    let temp_file = temp_file.ok_or_else(|| Error::BadRequest {
        msg: "missing file field".to_string(),
    })?;
    let file_name = file_name.unwrap_or_else(|| "upload.bin".to_string());

    let checksum_verified = if let Some(expected) = &checksum {
        let actual = format!("{:x}", hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(Error::IntegrityMismatch {
                msg: format!("sha256 mismatch: expected {expected}, got {actual}"),
            });
        }
        true
    } else {
        false
    };

    let upload_path = state.path_ctx.resolve_data_path(
        env_config
            .upload_path
            .as_deref()
            .ok_or_else(|| Error::Config { msg: "uploadPath not configured".to_string() })?,
    );
    tokio::fs::create_dir_all(&upload_path).await.map_err(|e| Error::Io {
        error: e,
        path: upload_path.display().to_string(),
    })?;

    let extracted = if should_extract {
        crate::archive::extract_zip(temp_file.path(), &upload_path).await?;
        true
    } else {
        crate::path::validate_path_component(&file_name)?;
        let final_path = upload_path.join(&file_name);
        crate::path::validate_path_within_base(&upload_path, &final_path)?;
        tokio::fs::copy(temp_file.path(), &final_path).await.map_err(|e| Error::Io {
            error: e,
            path: final_path.display().to_string(),
        })?;
        false
    };

    Ok(Json(UploadResponse {
        file_name,
        file_size,
        checksum_verified,
        extracted,
        upload_path: upload_path.display().to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    #[serde(rename = "uploadId")]
    upload_id: String,
    #[serde(rename = "totalChunks")]
    total_chunks: u32,
    #[serde(rename = "fileName")]
    file_name: String,
    #[serde(default)]
    #[allow(dead_code)]
    checksum: Option<String>,
    #[serde(rename = "shouldExtract", default)]
    should_extract: bool,
    env: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InitResponse {
    #[serde(rename = "uploadedChunks")]
    uploaded_chunks: Vec<u32>,
    #[serde(rename = "totalChunks")]
    total_chunks: u32,
    #[serde(rename = "isResume")]
    is_resume: bool,
}

pub async fn init(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<InitRequest>,
) -> Result<Json<InitResponse>> {
    auth_headers(&state, &headers, req.env.as_deref())?;

    let result = state
        .upload_store
        .init(
            &req.upload_id,
            req.total_chunks,
            &req.file_name,
            req.env.as_deref().unwrap_or_default(),
            req.should_extract,
        )
        .await?;

    Ok(Json(InitResponse {
        uploaded_chunks: result.uploaded_chunks,
        total_chunks: result.total_chunks,
        is_resume: result.is_resume,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    #[serde(rename = "uploadId")]
    upload_id: String,
    #[serde(rename = "chunkIndex")]
    chunk_index: u32,
    env: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChunkResponse {
    #[serde(rename = "chunkIndex")]
    chunk_index: u32,
}

pub async fn chunk(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChunkQuery>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<ChunkResponse>> {
    auth_headers(&state, &headers, query.env.as_deref())?;

    let expected_md5 = headers
        .get("X-Chunk-MD5")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let index = state
        .upload_store
        .chunk(&query.upload_id, query.chunk_index, &body, expected_md5.as_deref())
        .await?;

    Ok(Json(ChunkResponse { chunk_index: index }))
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    #[serde(rename = "uploadId")]
    upload_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    #[serde(rename = "fileName")]
    file_name: Option<String>,
    #[serde(default)]
    checksum: Option<String>,
    #[serde(rename = "shouldExtract", default)]
    #[allow(dead_code)]
    should_extract: bool,
    env: Option<String>,
}

pub async fn complete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<UploadResponse>> {
    let env_config = auth_headers(&state, &headers, req.env.as_deref())?;

    let upload_path = state.path_ctx.resolve_data_path(
        env_config
            .upload_path
            .as_deref()
            .ok_or_else(|| Error::Config { msg: "uploadPath not configured".to_string() })?,
    );

    let result = state
        .upload_store
        .complete(&req.upload_id, req.checksum.as_deref(), &upload_path)
        .await?;

    Ok(Json(UploadResponse {
        file_name: result.file_name,
        file_size: result.file_size,
        checksum_verified: result.checksum_verified,
        extracted: result.extracted,
        upload_path: result.upload_path.display().to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(rename = "uploadId")]
    upload_id: String,
    #[allow(dead_code)]
    env: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    exists: bool,
    #[serde(rename = "uploadedChunks")]
    uploaded_chunks: Vec<u32>,
    #[serde(rename = "totalChunks", skip_serializing_if = "Option::is_none")]
    total_chunks: Option<u32>,
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>> {
    auth_headers(&state, &headers, query.env.as_deref())?;

    let result = state.upload_store.status(&query.upload_id).await?;

    Ok(Json(StatusResponse {
        exists: result.exists,
        uploaded_chunks: result.uploaded_chunks,
        total_chunks: result.total_chunks,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    #[serde(rename = "uploadId")]
    upload_id: String,
    #[allow(dead_code)]
    env: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    success: bool,
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CancelQuery>,
    headers: HeaderMap,
) -> Result<Json<CancelResponse>> {
    auth_headers(&state, &headers, query.env.as_deref())?;
    state.upload_store.cancel(&query.upload_id).await?;
    Ok(Json(CancelResponse { success: true }))
}
