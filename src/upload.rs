//! Chunk upload coordinator (server side).
//!
//! Five operations on a shared fingerprint (`uploadId`): `init`, `chunk`,
//! `status`, `complete`, `cancel`. Metadata is the canonical on-disk state;
//! `uploadedChunks` is recomputed from the chunk files present whenever
//! metadata is missing or hasn't been loaded into memory yet (e.g. right
//! after a server restart).

use crate::error::{Error, Result, ResultIoExt};
use crate::path::validate_path_component;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

/// Default chunk size: 1 MiB. Not measured, a tunable per the source's own
/// design notes; exposed as a constant rather than config.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Default client worker pool size.
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 3;

/// Sweeper cadence.
pub const SWEEP_INTERVAL_SECS: u64 = 3600;

/// Tasks untouched for this long are considered abandoned.
pub const STALE_AFTER_SECS: i64 = 24 * 3600;

const METADATA_FILE: &str = "metadata.json";

/// On-disk/in-memory state for one in-progress upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    pub upload_id: String,
    pub total_chunks: u32,
    pub file_name: String,
    pub env: String,
    pub should_extract: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub uploaded_chunks: HashSet<u32>,
}

impl UploadTask {
    fn new(upload_id: String, total_chunks: u32, file_name: String, env: String, should_extract: bool) -> Self {
        let now = Utc::now();
        Self {
            upload_id,
            total_chunks,
            file_name,
            env,
            should_extract,
            created_at: now,
            updated_at: now,
            uploaded_chunks: HashSet::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.uploaded_chunks.len() == self.total_chunks as usize
            && (0..self.total_chunks).all(|i| self.uploaded_chunks.contains(&i))
    }
}

pub struct InitResult {
    pub uploaded_chunks: Vec<u32>,
    pub total_chunks: u32,
    pub is_resume: bool,
}

pub struct StatusResult {
    pub exists: bool,
    pub uploaded_chunks: Vec<u32>,
    pub total_chunks: Option<u32>,
}

pub struct CompleteResult {
    pub file_name: String,
    pub file_size: u64,
    pub checksum_verified: bool,
    pub extracted: bool,
    pub upload_path: PathBuf,
}

/// Registry of in-progress upload tasks. The outer `RwLock<HashMap<..>>` is
/// the "global mutex (or lock-free map)" governing the task-id → mutex
/// mapping; each task's own `Mutex` guards its metadata and chunk-directory
/// membership so concurrent writes to different uploads never interfere.
#[derive(Clone)]
pub struct UploadStore {
    tasks: Arc<RwLock<HashMap<String, Arc<Mutex<UploadTask>>>>>,
    chunk_root: PathBuf,
}

impl UploadStore {
    pub fn new(chunk_root: PathBuf) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            chunk_root,
        }
    }

    fn task_dir(&self, upload_id: &str) -> Result<PathBuf> {
        validate_path_component(upload_id)?;
        Ok(self.chunk_root.join(upload_id))
    }

    fn chunk_path(dir: &Path, index: u32) -> PathBuf {
        dir.join(format!("chunk_{index:06}"))
    }

    async fn write_metadata(dir: &Path, task: &UploadTask) -> Result<()> {
        let path = dir.join(METADATA_FILE);
        let tmp_path = dir.join(format!(".{METADATA_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(task).map_err(std::io::Error::other)?;
        fs::write(&tmp_path, &json).await.map_io_err(&tmp_path)?;
        fs::rename(&tmp_path, &path).await.map_io_err(&path)?;
        Ok(())
    }

    /// Recompute `uploaded_chunks` by scanning the chunk files actually
    /// present on disk. Used whenever metadata is stale or a task is loaded
    /// for the first time after a restart.
    async fn scan_uploaded_chunks(dir: &Path, total_chunks: u32) -> Result<HashSet<u32>> {
        let mut uploaded = HashSet::new();
        let mut entries = fs::read_dir(dir).await.map_io_err(dir)?;
        while let Some(entry) = entries.next_entry().await.map_io_err(dir)? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(idx_str) = name.strip_prefix("chunk_") {
                if let Ok(idx) = idx_str.parse::<u32>() {
                    if idx < total_chunks {
                        uploaded.insert(idx);
                    }
                }
            }
        }
        Ok(uploaded)
    }

    /// Load a task into memory, either from the in-memory map or by reading
    /// `metadata.json` off disk and recomputing `uploaded_chunks`.
    async fn load_task(&self, upload_id: &str) -> Result<Arc<Mutex<UploadTask>>> {
        {
            let tasks = self.tasks.read().await;
            if let Some(task) = tasks.get(upload_id) {
                return Ok(Arc::clone(task));
            }
        }

        let dir = self.task_dir(upload_id)?;
        let metadata_path = dir.join(METADATA_FILE);
        if !metadata_path.exists() {
            return Err(Error::BadRequest {
                msg: format!("unknown upload: {upload_id}"),
            });
        }

        let content = fs::read_to_string(&metadata_path).await.map_io_err(&metadata_path)?;
        let mut task: UploadTask = serde_json::from_str(&content).map_err(std::io::Error::other)?;
        task.uploaded_chunks = Self::scan_uploaded_chunks(&dir, task.total_chunks).await?;

        let handle = Arc::new(Mutex::new(task));
        let mut tasks = self.tasks.write().await;
        let handle = Arc::clone(tasks.entry(upload_id.to_string()).or_insert(handle));
        Ok(handle)
    }

    pub async fn init(
        &self,
        upload_id: &str,
        total_chunks: u32,
        file_name: &str,
        env: &str,
        should_extract: bool,
    ) -> Result<InitResult> {
        validate_path_component(upload_id)?;
        if total_chunks == 0 {
            return Err(Error::BadRequest {
                msg: "totalChunks must be at least 1".to_string(),
            });
        }

        let dir = self.task_dir(upload_id)?;
        let metadata_path = dir.join(METADATA_FILE);

        if metadata_path.exists() {
            let handle = self.load_task(upload_id).await?;
            let task = handle.lock().await;
            if task.total_chunks != total_chunks {
                return Err(Error::BadRequest {
                    msg: "totalChunks does not match existing upload".to_string(),
                });
            }
            let mut uploaded: Vec<u32> = task.uploaded_chunks.iter().copied().collect();
            uploaded.sort_unstable();
            return Ok(InitResult {
                uploaded_chunks: uploaded,
                total_chunks: task.total_chunks,
                is_resume: true,
            });
        }

        fs::create_dir_all(&dir).await.map_io_err(&dir)?;
        let task = UploadTask::new(
            upload_id.to_string(),
            total_chunks,
            file_name.to_string(),
            env.to_string(),
            should_extract,
        );
        Self::write_metadata(&dir, &task).await?;

        let handle = Arc::new(Mutex::new(task));
        self.tasks.write().await.insert(upload_id.to_string(), handle);

        Ok(InitResult {
            uploaded_chunks: Vec::new(),
            total_chunks,
            is_resume: false,
        })
    }

    pub async fn chunk(
        &self,
        upload_id: &str,
        index: u32,
        data: &[u8],
        expected_md5: Option<&str>,
    ) -> Result<u32> {
        if let Some(expected) = expected_md5 {
            let actual = format!("{:x}", md5::compute(data));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(Error::IntegrityMismatch {
                    msg: format!("chunk {index} md5 mismatch: expected {expected}, got {actual}"),
                });
            }
        }

        let handle = self.load_task(upload_id).await?;
        let dir = self.task_dir(upload_id)?;
        let mut task = handle.lock().await;

        if index >= task.total_chunks {
            return Err(Error::BadRequest {
                msg: format!("chunk index {index} out of range (0..{})", task.total_chunks),
            });
        }

        let chunk_path = Self::chunk_path(&dir, index);
        let tmp_path = dir.join(format!(".chunk_{index:06}.tmp"));
        let mut file = fs::File::create(&tmp_path).await.map_io_err(&tmp_path)?;
        file.write_all(data).await.map_io_err(&tmp_path)?;
        file.sync_all().await.map_io_err(&tmp_path)?;
        drop(file);
        fs::rename(&tmp_path, &chunk_path).await.map_io_err(&chunk_path)?;

        task.uploaded_chunks.insert(index);
        task.updated_at = Utc::now();
        Self::write_metadata(&dir, &task).await?;

        Ok(index)
    }

    pub async fn status(&self, upload_id: &str) -> Result<StatusResult> {
        let dir = self.task_dir(upload_id)?;
        if !dir.join(METADATA_FILE).exists() {
            return Ok(StatusResult {
                exists: false,
                uploaded_chunks: Vec::new(),
                total_chunks: None,
            });
        }

        let handle = self.load_task(upload_id).await?;
        let task = handle.lock().await;
        let mut uploaded: Vec<u32> = task.uploaded_chunks.iter().copied().collect();
        uploaded.sort_unstable();

        Ok(StatusResult {
            exists: true,
            uploaded_chunks: uploaded,
            total_chunks: Some(task.total_chunks),
        })
    }

    /// Merge, verify, and place the completed upload, removing the task
    /// directory on success or on a checksum failure alike — either way the
    /// task no longer exists afterward.
    pub async fn complete(
        &self,
        upload_id: &str,
        expected_checksum: Option<&str>,
        destination: &Path,
    ) -> Result<CompleteResult> {
        let handle = self.load_task(upload_id).await?;
        let dir = self.task_dir(upload_id)?;
        let task = handle.lock().await;

        if !task.is_complete() {
            let missing: Vec<u32> = (0..task.total_chunks)
                .filter(|i| !task.uploaded_chunks.contains(i))
                .collect();
            return Err(Error::BadRequest {
                msg: format!("upload incomplete, missing chunks: {missing:?}"),
            });
        }

        let merged_path = dir.join("merged.bin");
        let mut hasher = sha2::Sha256::new();
        let mut file_size = 0u64;
        {
            let mut out = fs::File::create(&merged_path).await.map_io_err(&merged_path)?;
            for index in 0..task.total_chunks {
                let chunk_path = Self::chunk_path(&dir, index);
                let data = fs::read(&chunk_path).await.map_io_err(&chunk_path)?;
                hasher.update(&data);
                out.write_all(&data).await.map_io_err(&merged_path)?;
                file_size += data.len() as u64;
            }
            out.sync_all().await.map_io_err(&merged_path)?;
        }

        let checksum_verified = if let Some(expected) = expected_checksum {
            let actual = format!("{:x}", hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                drop(task);
                self.remove_task(upload_id, &dir).await?;
                return Err(Error::IntegrityMismatch {
                    msg: format!("sha256 mismatch: expected {expected}, got {actual}"),
                });
            }
            true
        } else {
            false
        };

        let file_name = task.file_name.clone();
        let should_extract = task.should_extract;

        fs::create_dir_all(destination).await.map_io_err(destination)?;

        let extracted = if should_extract {
            crate::archive::extract_zip(&merged_path, destination).await?;
            true
        } else {
            validate_path_component(&file_name)?;
            let final_path = destination.join(&file_name);
            crate::path::validate_path_within_base(destination, &final_path)?;
            fs::copy(&merged_path, &final_path).await.map_io_err(&final_path)?;
            false
        };

        drop(task);
        self.remove_task(upload_id, &dir).await?;

        Ok(CompleteResult {
            file_name,
            file_size,
            checksum_verified,
            extracted,
            upload_path: destination.to_path_buf(),
        })
    }

    pub async fn cancel(&self, upload_id: &str) -> Result<()> {
        let dir = self.task_dir(upload_id)?;
        self.remove_task(upload_id, &dir).await
    }

    async fn remove_task(&self, upload_id: &str, dir: &Path) -> Result<()> {
        self.tasks.write().await.remove(upload_id);
        if dir.exists() {
            fs::remove_dir_all(dir).await.map_io_err(dir)?;
        }
        Ok(())
    }

    /// Remove any task whose `updatedAt` is older than [`STALE_AFTER_SECS`].
    /// Skips tasks currently locked by a chunk write by acquiring the same
    /// per-task mutex before re-checking staleness and deleting.
    pub async fn sweep(&self) -> Result<u32> {
        if !self.chunk_root.exists() {
            return Ok(0);
        }

        let mut removed = 0u32;
        let mut entries = fs::read_dir(&self.chunk_root).await.map_io_err(&self.chunk_root)?;
        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_io_err(&self.chunk_root)? {
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    candidates.push(name.to_string());
                }
            }
        }

        for upload_id in candidates {
            let dir = match self.task_dir(&upload_id) {
                Ok(dir) => dir,
                Err(_) => continue,
            };
            let metadata_path = dir.join(METADATA_FILE);

            let stale = if metadata_path.exists() {
                match self.load_task(&upload_id).await {
                    Ok(handle) => {
                        let task = handle.lock().await;
                        Utc::now().signed_duration_since(task.updated_at).num_seconds()
                            > STALE_AFTER_SECS
                    }
                    Err(_) => false,
                }
            } else {
                match fs::metadata(&dir).await {
                    Ok(meta) => meta
                        .modified()
                        .ok()
                        .and_then(|m| m.elapsed().ok())
                        .map(|age| age.as_secs() as i64 > STALE_AFTER_SECS)
                        .unwrap_or(false),
                    Err(_) => false,
                }
            };

            if stale {
                if self.remove_task(&upload_id, &dir).await.is_ok() {
                    removed += 1;
                    tracing::info!(upload_id, "swept stale upload task");
                }
            }
        }

        Ok(removed)
    }
}

/// Spawn the hourly sweep loop.
pub fn spawn_sweeper(store: UploadStore) {
    tokio::spawn(async move {
        let interval = std::time::Duration::from_secs(SWEEP_INTERVAL_SECS);
        loop {
            tokio::time::sleep(interval).await;
            match store.sweep().await {
                Ok(count) if count > 0 => {
                    tracing::info!(count, "removed stale upload tasks");
                }
                Err(e) => {
                    tracing::error!(error = %e, "upload sweep failed");
                }
                _ => {}
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn init_then_chunk_then_complete_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(dir.path().to_path_buf());
        let dest = TempDir::new().unwrap();

        let data = b"hello world, this is chunked".to_vec();
        let chunk_size = 10;
        let total_chunks = data.len().div_ceil(chunk_size) as u32;

        let init = store
            .init("abc123", total_chunks, "hello.txt", "test", false)
            .await
            .unwrap();
        assert!(!init.is_resume);
        assert_eq!(init.uploaded_chunks.len(), 0);

        for i in 0..total_chunks {
            let start = i as usize * chunk_size;
            let end = (start + chunk_size).min(data.len());
            store.chunk("abc123", i, &data[start..end], None).await.unwrap();
        }

        let expected_sha = format!("{:x}", sha2::Sha256::digest(&data));
        let result = store
            .complete("abc123", Some(&expected_sha), dest.path())
            .await
            .unwrap();

        assert!(result.checksum_verified);
        assert!(!result.extracted);
        let written = std::fs::read(dest.path().join("hello.txt")).unwrap();
        assert_eq!(written, data);
    }

    #[tokio::test]
    async fn re_upload_same_chunk_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(dir.path().to_path_buf());

        store.init("rep1", 2, "f.bin", "test", false).await.unwrap();
        store.chunk("rep1", 0, b"aaaa", None).await.unwrap();
        store.chunk("rep1", 0, b"aaaa", None).await.unwrap();

        let status = store.status("rep1").await.unwrap();
        assert_eq!(status.uploaded_chunks, vec![0]);
    }

    #[tokio::test]
    async fn chunk_md5_mismatch_does_not_abort_task() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(dir.path().to_path_buf());
        store.init("md5check", 1, "f.bin", "test", false).await.unwrap();

        let err = store.chunk("md5check", 0, b"data", Some("deadbeef")).await.unwrap_err();
        assert!(matches!(err, Error::IntegrityMismatch { .. }));

        // task is still alive and can accept the correct chunk
        let status = store.status("md5check").await.unwrap();
        assert!(status.exists);
    }

    #[tokio::test]
    async fn resume_reports_existing_chunks() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(dir.path().to_path_buf());

        store.init("resume1", 3, "f.bin", "test", false).await.unwrap();
        store.chunk("resume1", 0, b"aa", None).await.unwrap();
        store.chunk("resume1", 1, b"bb", None).await.unwrap();

        let init2 = store.init("resume1", 3, "f.bin", "test", false).await.unwrap();
        assert!(init2.is_resume);
        assert_eq!(init2.uploaded_chunks, vec![0, 1]);
    }

    #[tokio::test]
    async fn complete_checksum_mismatch_deletes_task() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(dir.path().to_path_buf());
        let dest = TempDir::new().unwrap();

        store.init("badsum", 1, "f.bin", "test", false).await.unwrap();
        store.chunk("badsum", 0, b"data", None).await.unwrap();

        let err = store
            .complete("badsum", Some("0000000000000000000000000000000000000000000000000000000000000000"), dest.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IntegrityMismatch { .. }));

        let status = store.status("badsum").await.unwrap();
        assert!(!status.exists);
    }

    #[tokio::test]
    async fn complete_before_all_chunks_fails() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(dir.path().to_path_buf());
        let dest = TempDir::new().unwrap();

        store.init("partial", 2, "f.bin", "test", false).await.unwrap();
        store.chunk("partial", 0, b"aa", None).await.unwrap();

        let err = store.complete("partial", None, dest.path()).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }
}
