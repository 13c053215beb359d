//! Command preparation and execution.
//!
//! Native mode runs the configured command through `sh -c` in the config
//! directory. Container mode wraps it in an SSH call to the host, since the
//! server process itself has no access to the host filesystem or the
//! deployment target's runtime.

use crate::error::{Error, Result};
use crate::path::PathContext;
use std::path::{Path, PathBuf};
use tokio::process::Command;

const SSH_IDENTITY_PATH: &str = "/etc/fde/ssh/id_ed25519";

#[derive(Debug, Clone)]
pub struct PreparedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// Prepare the command to invoke for `deploy_command`, native or over SSH.
pub fn prepare(ctx: &PathContext, deploy_command: &str, upload_path: &Path) -> Result<PreparedCommand> {
    let resolved = ctx.resolve_command_cwd(deploy_command);

    if !ctx.is_container {
        return Ok(PreparedCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), resolved.command],
            cwd: resolved.cwd,
        });
    }

    let host = std::env::var("FDE_SSH_HOST").map_err(|_| Error::Config {
        msg: "FDE_SSH_HOST must be set in container mode".to_string(),
    })?;
    let user = std::env::var("FDE_SSH_USER").unwrap_or_else(|_| "root".to_string());
    let port = std::env::var("FDE_SSH_PORT").unwrap_or_else(|_| "22".to_string());

    let mut tokens = resolved.command.splitn(2, char::is_whitespace);
    let script_token = tokens.next().unwrap_or("");
    let remaining_args = tokens.next().unwrap_or("").trim();

    let remote_command = if is_script_path(script_token) {
        let script_dir = Path::new(script_token)
            .parent()
            .filter(|p| !p.as_os_str().is_empty() && p.as_os_str() != ".")
            .map(|p| resolved.cwd.join(p))
            .unwrap_or_else(|| resolved.cwd.clone());
        let script_name = Path::new(script_token)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| script_token.to_string());

        let invocation = if remaining_args.is_empty() {
            format!("./{script_name}")
        } else {
            format!("./{script_name} {remaining_args}")
        };

        format!(
            "mkdir -p '{}' && cd '{}' && {}",
            upload_path.display(),
            script_dir.display(),
            invocation
        )
    } else {
        format!(
            "mkdir -p '{}' && cd '{}' && {}",
            upload_path.display(),
            resolved.cwd.display(),
            resolved.command
        )
    };

    let args = vec![
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "IdentitiesOnly=yes".to_string(),
        "-i".to_string(),
        SSH_IDENTITY_PATH.to_string(),
        "-p".to_string(),
        port,
        "-q".to_string(),
        format!("{user}@{host}"),
        remote_command,
    ];

    Ok(PreparedCommand {
        program: "ssh".to_string(),
        args,
        cwd: resolved.cwd,
    })
}

fn is_script_path(token: &str) -> bool {
    token.starts_with("./") || token.starts_with("../") || Path::new(token).is_absolute()
}

pub struct SyncResult {
    pub stdout: String,
    pub stderr: String,
}

/// Run a prepared command to completion and collect its output, used by the
/// non-streamed path for small deploy commands that finish immediately.
pub async fn run_sync(prepared: &PreparedCommand) -> Result<SyncResult> {
    let output = Command::new(&prepared.program)
        .args(&prepared.args)
        .current_dir(&prepared.cwd)
        .output()
        .await
        .map_err(|e| Error::Io {
            error: e,
            path: prepared.cwd.display().to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if output.status.success() {
        Ok(SyncResult { stdout, stderr })
    } else {
        Err(Error::ExecutionFailed {
            exit_code: output.status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}
