//! Path & command resolution.
//!
//! Converts config strings into absolute paths and decides `(command, cwd)` for
//! subprocess execution, with identical semantics whether the server runs
//! natively or inside a container that proxies execution to a host via SSH.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Fixed anchor used to resolve relative data paths when running in a container.
const CONTAINER_DATA_ANCHOR: &str = "/app";

pub fn is_container_mode() -> bool {
    std::env::var("FDE_CONTAINER").is_ok() || Path::new("/.dockerenv").exists()
}

/// Carries both anchors a path/command can be resolved against, plus whether
/// the server is running in container mode. Pure data: nothing stateful lives
/// here.
#[derive(Debug, Clone)]
pub struct PathContext {
    /// Directory containing the loaded config file. Commands always run here
    /// in native mode; in container mode it is the *host-side* directory the
    /// SSH wrapper lands in.
    pub config_dir: PathBuf,
    /// Host-side config directory, mandatory when `is_container` is true.
    pub host_config_dir: Option<PathBuf>,
    pub is_container: bool,
}

impl PathContext {
    /// Build a `PathContext` for the running process. Fails fatally if
    /// container mode is active but `FDE_HOST_CONFIG_DIR` is not set.
    pub fn from_env(config_dir: PathBuf) -> Result<Self> {
        let is_container = is_container_mode();

        let host_config_dir = if is_container {
            let val = std::env::var("FDE_HOST_CONFIG_DIR").map_err(|_| Error::Config {
                msg: "FDE_HOST_CONFIG_DIR must be set when running in container mode".to_string(),
            })?;
            Some(PathBuf::from(val))
        } else {
            None
        };

        Ok(Self {
            config_dir,
            host_config_dir,
            is_container,
        })
    }

    /// Resolve a possibly-relative data path to an absolute one.
    ///
    /// Absolute paths pass through unchanged. Relative paths resolve against
    /// the fixed container anchor in container mode, else against the config
    /// directory.
    pub fn resolve_data_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }

        if self.is_container {
            Path::new(CONTAINER_DATA_ANCHOR).join(path)
        } else {
            self.config_dir.join(path)
        }
    }

    /// Resolve `(command, cwd)` for running a deploy command.
    ///
    /// The command string is never rewritten. In native mode `cwd` is the
    /// config directory; in container mode it is the host-side config
    /// directory (the directory visible to the shell reached through the SSH
    /// wrapper), since that shell never sees the container's filesystem.
    pub fn resolve_command_cwd(&self, command: &str) -> ResolvedCommand {
        let cwd = if self.is_container {
            self.host_config_dir
                .clone()
                .expect("host_config_dir is mandatory in container mode")
        } else {
            self.config_dir.clone()
        };

        ResolvedCommand {
            command: command.to_string(),
            cwd,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub command: String,
    pub cwd: PathBuf,
}

/// Validate a single path component (used for `uploadId`, env names, etc.) to
/// prevent directory traversal.
pub fn validate_path_component(component: &str) -> Result<()> {
    if component.is_empty() {
        return Err(Error::BadRequest {
            msg: "path component cannot be empty".to_string(),
        });
    }

    if component == "." || component == ".." {
        return Err(Error::BadRequest {
            msg: format!("invalid path component: '{component}'"),
        });
    }

    if component.len() > 64 {
        return Err(Error::BadRequest {
            msg: "path component too long".to_string(),
        });
    }

    if !component
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        return Err(Error::BadRequest {
            msg: "path component contains invalid characters".to_string(),
        });
    }

    Ok(())
}

/// Validate that a constructed path is (or would be) within `base`.
pub fn validate_path_within_base(base: &Path, path: &Path) -> Result<()> {
    use crate::error::ResultIoExt;

    let canonical_base = base.canonicalize().map_io_err(base)?;

    let path_to_check = if path.exists() {
        path.canonicalize()?
    } else if let Some(parent) = path.parent() {
        if parent.exists() {
            parent.canonicalize()?.join(path.file_name().ok_or_else(|| Error::BadRequest {
                msg: "invalid path structure".to_string(),
            })?)
        } else {
            return Ok(());
        }
    } else {
        return Err(Error::BadRequest {
            msg: "invalid path structure".to_string(),
        });
    };

    if !path_to_check.starts_with(&canonical_base) {
        return Err(Error::BadRequest {
            msg: "path traversal detected".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_path_passes_through() {
        let ctx = PathContext {
            config_dir: PathBuf::from("/etc/fde"),
            host_config_dir: None,
            is_container: false,
        };
        assert_eq!(
            ctx.resolve_data_path(Path::new("/var/data")),
            PathBuf::from("/var/data")
        );
    }

    #[test]
    fn relative_path_resolves_against_config_dir_natively() {
        let ctx = PathContext {
            config_dir: PathBuf::from("/etc/fde"),
            host_config_dir: None,
            is_container: false,
        };
        assert_eq!(
            ctx.resolve_data_path(Path::new("data")),
            PathBuf::from("/etc/fde/data")
        );
    }

    #[test]
    fn relative_path_resolves_against_container_anchor() {
        let ctx = PathContext {
            config_dir: PathBuf::from("/etc/fde"),
            host_config_dir: Some(PathBuf::from("/home/op/app")),
            is_container: true,
        };
        assert_eq!(
            ctx.resolve_data_path(Path::new("data")),
            PathBuf::from("/app/data")
        );
    }

    #[test]
    fn command_cwd_uses_host_dir_in_container_mode() {
        let ctx = PathContext {
            config_dir: PathBuf::from("/etc/fde"),
            host_config_dir: Some(PathBuf::from("/home/op/app")),
            is_container: true,
        };
        let resolved = ctx.resolve_command_cwd("./scripts/deploy.sh ./dist");
        assert_eq!(resolved.cwd, PathBuf::from("/home/op/app"));
        assert_eq!(resolved.command, "./scripts/deploy.sh ./dist");
    }

    #[test]
    fn rejects_traversal_components() {
        assert!(validate_path_component("..").is_err());
        assert!(validate_path_component("a/b").is_err());
        assert!(validate_path_component("").is_err());
        assert!(validate_path_component("abc123-_.").is_ok());
    }
}
