use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{AppError, Result};

const TOOL_PATH_ENV: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Absolute paths of the WireGuard tools the helper is allowed to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub wg: PathBuf,
    pub wg_quick: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            wg: PathBuf::from("/usr/bin/wg"),
            wg_quick: PathBuf::from("/usr/bin/wg-quick"),
        }
    }
}

/// Run a tool with a cleared environment.
pub(crate) async fn run_output(bin: &Path, args: &[&str]) -> Result<Output> {
    debug!(cmd = format!("{} {}", bin.display(), args.join(" ")), "exec");
    Command::new(bin)
        .args(args)
        .env_clear()
        .env("PATH", TOOL_PATH_ENV)
        .env("LANG", "C")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| AppError::Tool(format!("{} failed to start: {}", bin.display(), e)))
}

/// Run a tool and fail with its stderr when it exits non-zero.
pub(crate) async fn run_checked(bin: &Path, args: &[&str]) -> Result<String> {
    let output = run_output(bin, args).await?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(AppError::Tool(format_command_failure(
        bin,
        args,
        output.status,
        &stderr,
    )))
}

/// Run a tool and return whatever it wrote to stdout, even when it failed.
pub(crate) async fn run_lenient(bin: &Path, args: &[&str]) -> String {
    match run_output(bin, args).await {
        Ok(output) => {
            if !output.status.success() {
                debug!(
                    cmd = ?bin.display().to_string(),
                    status = ?output.status.to_string(),
                    stderr = ?String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    "exec_failure_tolerated"
                );
            }
            String::from_utf8_lossy(&output.stdout).into_owned()
        }
        Err(e) => {
            warn!( error = ?e.to_string(), "exec_spawn_failure_tolerated");
            String::new()
        }
    }
}

fn format_command_failure(
    bin: &Path,
    args: &[&str],
    status: std::process::ExitStatus,
    stderr: &str,
) -> String {
    let command = format!("{} {}", bin.display(), args.join(" "));
    if stderr.is_empty() {
        format!("command {} failed: {}", command, status)
    } else {
        format!("command {} failed: {}\n{}", command, status, stderr)
    }
}
