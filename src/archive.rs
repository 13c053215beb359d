//! Archive orchestration.
//!
//! Client side: a scoped temporary zip file that is always removed on exit,
//! whatever the exit path. Server side: extraction of a merged upload into
//! the target upload path. The zip codec's byte layout is not part of what
//! this module specifies; it just drives the `zip` crate correctly.

use crate::error::{Error, Result, ResultIoExt};
use glob::Pattern;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A zip file created in the OS temp directory that deletes itself when
/// dropped, regardless of whether the caller finished normally, returned an
/// error, or panicked while holding it.
pub struct ScopedArchive {
    path: PathBuf,
}

impl ScopedArchive {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedArchive {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove scoped archive");
            }
        }
    }
}

/// Build a zip archive of `source_dir` under a unique temp-directory name,
/// excluding paths (relative to `source_dir`) matching any of
/// `exclude_patterns`. Dotfiles are excluded unless a pattern explicitly
/// matches them back in (glob semantics: a leading dot is just a character).
pub async fn build_archive(source_dir: &Path, env: &str, exclude_patterns: &[String], timestamp_millis: u64) -> Result<ScopedArchive> {
    let source_dir = source_dir.to_path_buf();
    let env = env.to_string();
    let patterns: Vec<Pattern> = exclude_patterns
        .iter()
        .filter_map(|p| Pattern::new(p).ok())
        .collect();

    let archive_path = std::env::temp_dir().join(format!("deploy-{env}-{timestamp_millis}.zip"));
    let archive_path_clone = archive_path.clone();

    tokio::task::spawn_blocking(move || build_archive_blocking(&source_dir, &archive_path_clone, &patterns))
        .await
        .map_err(|e| std::io::Error::other(format!("archive task join error: {e}")))??;

    Ok(ScopedArchive { path: archive_path })
}

fn build_archive_blocking(source_dir: &Path, archive_path: &Path, patterns: &[Pattern]) -> Result<()> {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let file = std::fs::File::create(archive_path).map_io_err(archive_path)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in WalkDir::new(source_dir).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if path == source_dir {
            continue;
        }
        let relative = path.strip_prefix(source_dir).unwrap();
        let relative_str = relative.to_string_lossy().replace('\\', "/");

        if patterns.iter().any(|p| p.matches(&relative_str)) {
            continue;
        }

        if path.is_dir() {
            writer
                .add_directory(format!("{relative_str}/"), options)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
        } else {
            writer
                .start_file(relative_str, options)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            let data = std::fs::read(path).map_io_err(path)?;
            writer.write_all(&data).map_io_err(archive_path)?;
        }
    }

    writer.finish().map_err(|e| std::io::Error::other(e.to_string()))?;
    Ok(())
}

/// Extract a zip file (the merged upload) into `dest_dir`, creating it if
/// necessary.
pub async fn extract_zip(zip_path: &Path, dest_dir: &Path) -> Result<()> {
    let zip_path = zip_path.to_path_buf();
    let dest_dir = dest_dir.to_path_buf();

    tokio::task::spawn_blocking(move || extract_zip_blocking(&zip_path, &dest_dir))
        .await
        .map_err(|e| std::io::Error::other(format!("extract task join error: {e}")))??;

    Ok(())
}

fn extract_zip_blocking(zip_path: &Path, dest_dir: &Path) -> Result<()> {
    let file = std::fs::File::open(zip_path).map_io_err(zip_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| {
        Error::IntegrityMismatch {
            msg: format!("invalid archive: {e}"),
        }
    })?;

    std::fs::create_dir_all(dest_dir).map_io_err(dest_dir)?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::IntegrityMismatch {
                msg: format!("invalid archive entry: {e}"),
            })?;

        let out_path = match entry.enclosed_name() {
            Some(name) => dest_dir.join(name),
            None => continue,
        };

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_io_err(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent).map_io_err(parent)?;
            }
            let mut out_file = std::fs::File::create(&out_path).map_io_err(&out_path)?;
            std::io::copy(&mut entry, &mut out_file).map_io_err(&out_path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn build_and_extract_roundtrip() {
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("hello.txt"), b"Hello, World!").unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub").join("nested.txt"), b"nested").unwrap();
        std::fs::write(src.path().join(".secret"), b"excluded").unwrap();

        let archive = build_archive(src.path(), "test", &[".secret".to_string()], 1234)
            .await
            .unwrap();
        assert!(archive.path().exists());

        let dest = TempDir::new().unwrap();
        extract_zip(archive.path(), dest.path()).await.unwrap();

        assert_eq!(std::fs::read(dest.path().join("hello.txt")).unwrap(), b"Hello, World!");
        assert_eq!(std::fs::read(dest.path().join("sub").join("nested.txt")).unwrap(), b"nested");
        assert!(!dest.path().join(".secret").exists());
    }

    #[tokio::test]
    async fn archive_deletes_itself_on_drop() {
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("a.txt"), b"a").unwrap();

        let path = {
            let archive = build_archive(src.path(), "test", &[], 5678).await.unwrap();
            let path = archive.path().to_path_buf();
            assert!(path.exists());
            path
        };

        assert!(!path.exists());
    }
}
