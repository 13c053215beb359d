//! Chunked upload client: hashes the file once, uploads whatever chunks the
//! server says it doesn't have yet, with a small worker pool and per-chunk
//! retry.

use super::{error_for_status_with_body, http_client, map_reqwest_err, Connection};
use crate::error::{Error, Result};
use crate::upload::{DEFAULT_CHUNK_SIZE, DEFAULT_UPLOAD_CONCURRENCY};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

const MAX_CHUNK_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct CompleteOutcome {
    pub file_name: String,
    pub file_size: u64,
    pub checksum_verified: bool,
    pub extracted: bool,
    pub upload_path: String,
}

#[derive(Debug, Deserialize)]
struct InitResponse {
    #[serde(rename = "uploadedChunks")]
    uploaded_chunks: Vec<u32>,
    #[serde(rename = "totalChunks")]
    #[allow(dead_code)]
    total_chunks: u32,
    #[serde(rename = "isResume")]
    is_resume: bool,
}

#[derive(Debug, Deserialize)]
struct CompleteResponse {
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

#[derive(Debug, Serialize)]
struct InitRequest<'a> {
    #[serde(rename = "uploadId")]
    upload_id: &'a str,
    #[serde(rename = "totalChunks")]
    total_chunks: u32,
    #[serde(rename = "fileName")]
    file_name: &'a str,
    #[serde(rename = "shouldExtract")]
    should_extract: bool,
    env: &'a str,
}

#[derive(Debug, Serialize)]
struct CompleteRequest<'a> {
    #[serde(rename = "uploadId")]
    upload_id: &'a str,
    #[serde(rename = "fileName")]
    file_name: &'a str,
    checksum: &'a str,
    #[serde(rename = "shouldExtract")]
    should_extract: bool,
    env: &'a str,
}

/// Derives the upload id the same way the server expects: the first 32 hex
/// characters of the whole file's sha256.
fn derive_upload_id(sha256_hex: &str) -> String {
    sha256_hex[..32].to_string()
}

async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| Error::Io {
        error: e,
        path: path.display().to_string(),
    })?;
    let mut hasher = sha2::Sha256::new();
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| Error::Io {
            error: e,
            path: path.display().to_string(),
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

async fn read_chunk(path: &Path, index: u32, chunk_size: usize) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| Error::Io {
        error: e,
        path: path.display().to_string(),
    })?;
    file.seek(std::io::SeekFrom::Start(index as u64 * chunk_size as u64))
        .await
        .map_err(|e| Error::Io { error: e, path: path.display().to_string() })?;

    let mut buf = vec![0u8; chunk_size];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await.map_err(|e| Error::Io {
            error: e,
            path: path.display().to_string(),
        })?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

#[derive(Clone)]
pub struct UploadClient {
    http: reqwest::Client,
    conn: Connection,
}

impl UploadClient {
    pub fn new(conn: Connection) -> Self {
        Self { http: http_client(), conn }
    }

    /// Uploads `path`, resuming any chunks the server already has, and
    /// returns the server's completion summary.
    pub async fn upload_file(
        &self,
        path: &Path,
        file_name: &str,
        should_extract: bool,
        mut on_progress: impl FnMut(u32, u32),
    ) -> Result<CompleteOutcome> {
        let file_size = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::Io { error: e, path: path.display().to_string() })?
            .len();
        let sha256_hex = sha256_file(path).await?;
        let upload_id = derive_upload_id(&sha256_hex);
        let chunk_size = DEFAULT_CHUNK_SIZE as u64;
        let total_chunks = (file_size.div_ceil(chunk_size)).max(1) as u32;

        let init = self.init(&upload_id, total_chunks, file_name, should_extract).await?;
        if init.is_resume {
            tracing::info!(upload_id = %upload_id, already = init.uploaded_chunks.len(), "resuming upload");
        }
        let uploaded: std::collections::HashSet<u32> = init.uploaded_chunks.into_iter().collect();
        let pending: VecDeque<u32> = (0..total_chunks).filter(|i| !uploaded.contains(i)).collect();

        on_progress(uploaded.len() as u32, total_chunks);
        if !pending.is_empty() {
            self.upload_chunks(path, &upload_id, pending, DEFAULT_CHUNK_SIZE, total_chunks, &mut on_progress)
                .await?;
        }

        let result = self.complete(&upload_id, file_name, &sha256_hex, should_extract).await?;
        Ok(CompleteOutcome {
            file_name: result.file_name,
            file_size: result.file_size,
            checksum_verified: result.checksum_verified,
            extracted: result.extracted,
            upload_path: result.upload_path,
        })
    }

    async fn init(
        &self,
        upload_id: &str,
        total_chunks: u32,
        file_name: &str,
        should_extract: bool,
    ) -> Result<InitResponse> {
        let response = self
            .http
            .post(self.conn.url("/upload/init"))
            .header("Authorization", &self.conn.token)
            .json(&InitRequest {
                upload_id,
                total_chunks,
                file_name,
                should_extract,
                env: &self.conn.env,
            })
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let response = error_for_status_with_body(response).await?;
        response.json().await.map_err(map_reqwest_err)
    }

    async fn upload_chunks(
        &self,
        path: &Path,
        upload_id: &str,
        pending: VecDeque<u32>,
        chunk_size: usize,
        total_chunks: u32,
        on_progress: &mut impl FnMut(u32, u32),
    ) -> Result<()> {
        let queue = Arc::new(Mutex::new(pending));
        let done = Arc::new(std::sync::atomic::AtomicU32::new(total_chunks - queue.lock().await.len() as u32));
        let abort = Arc::new(AtomicBool::new(false));
        let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

        let mut workers = Vec::new();
        for _ in 0..DEFAULT_UPLOAD_CONCURRENCY {
            let client = self.clone();
            let path = path.to_path_buf();
            let upload_id = upload_id.to_string();
            let queue = Arc::clone(&queue);
            let abort = Arc::clone(&abort);
            let first_error = Arc::clone(&first_error);
            let done = Arc::clone(&done);

            workers.push(tokio::spawn(async move {
                loop {
                    if abort.load(Ordering::Relaxed) {
                        break;
                    }
                    let index = { queue.lock().await.pop_front() };
                    let Some(index) = index else { break };

                    match client.upload_chunk_with_retry(&path, &upload_id, index, chunk_size).await {
                        Ok(()) => {
                            done.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            abort.store(true, Ordering::Relaxed);
                            let mut slot = first_error.lock().await;
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                            break;
                        }
                    }
                }
            }));
        }

        // Poll progress while workers drain the queue; cheap and matches the
        // coarse-grained progress bars the rest of the client uses.
        loop {
            let remaining = queue.lock().await.len() as u32;
            on_progress(done.load(Ordering::Relaxed), total_chunks);
            if workers.iter().all(|w| w.is_finished()) {
                break;
            }
            if remaining == 0 && abort.load(Ordering::Relaxed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        for w in workers {
            let _ = w.await;
        }
        on_progress(done.load(Ordering::Relaxed), total_chunks);

        if let Ok(mutex) = Arc::try_unwrap(first_error) {
            if let Some(e) = mutex.into_inner() {
                return Err(e);
            }
        }
        Ok(())
    }

    async fn upload_chunk_with_retry(
        &self,
        path: &Path,
        upload_id: &str,
        index: u32,
        chunk_size: usize,
    ) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..=MAX_CHUNK_RETRIES {
            match self.upload_chunk_once(path, upload_id, index, chunk_size).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(chunk = index, attempt, error = %e, "chunk upload failed");
                    last_err = Some(e);
                    if attempt == MAX_CHUNK_RETRIES {
                        break;
                    }
                    let backoff_ms = (1000u64.saturating_mul(1u64 << attempt)).min(10_000);
                    let jitter_ms = rand::random::<u64>() % 500;
                    tokio::time::sleep(Duration::from_millis(backoff_ms + jitter_ms)).await;
                }
            }
        }
        Err(last_err.expect("at least one attempt was made"))
    }

    async fn upload_chunk_once(&self, path: &Path, upload_id: &str, index: u32, chunk_size: usize) -> Result<()> {
        let bytes = read_chunk(path, index, chunk_size).await?;
        let digest = md5::compute(&bytes);
        let md5_hex = format!("{digest:x}");

        let response = self
            .http
            .post(self.conn.url("/upload/chunk"))
            .query(&[
                ("uploadId", upload_id),
                ("chunkIndex", &index.to_string()),
                ("env", &self.conn.env),
            ])
            .header("Authorization", &self.conn.token)
            .header("X-Chunk-MD5", md5_hex)
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        error_for_status_with_body(response).await?;
        Ok(())
    }

    async fn complete(
        &self,
        upload_id: &str,
        file_name: &str,
        checksum: &str,
        should_extract: bool,
    ) -> Result<CompleteResponse> {
        let response = self
            .http
            .post(self.conn.url("/upload/complete"))
            .header("Authorization", &self.conn.token)
            .json(&CompleteRequest {
                upload_id,
                file_name,
                checksum,
                should_extract,
                env: &self.conn.env,
            })
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let response = error_for_status_with_body(response).await?;
        response.json().await.map_err(map_reqwest_err)
    }

    pub async fn cancel(&self, upload_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.conn.url("/upload/cancel"))
            .query(&[("uploadId", upload_id), ("env", &self.conn.env)])
            .header("Authorization", &self.conn.token)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        error_for_status_with_body(response).await?;
        Ok(())
    }
}
