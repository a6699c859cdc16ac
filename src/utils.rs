use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use crate::errors::{AppError, Result};
use log::{debug, error, info};

/// Captured result of an external tool run.
#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs an external tool to completion, killing it if `cancel` fires first.
/// A non-zero exit is normalized through the backend error classifier.
pub async fn run_tool(program: &str, args: &[String], cancel: &CancellationToken) -> Result<ToolOutput> {
    debug!("[TOOL] {} {}", program, args.join(" "));

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AppError::Subprocess(format!("Failed to start {}: {}", program, e)))?;

    let output = tokio::select! {
        output = child.wait_with_output() => output
            .map_err(|e| AppError::Subprocess(format!("Failed to wait for {}: {}", program, e)))?,
        _ = cancel.cancelled() => {
            // dropping the wait future drops the child, which kills it
            return Err(AppError::Cancelled(format!("{} interrupted", program)));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !output.status.success() {
        error!("[TOOL] {} exited with {}: {}", program, output.status, stderr.trim());
        return Err(AppError::classify_backend_output(&stderr));
    }

    Ok(ToolOutput { stdout, stderr })
}

/// Creates a directory if it doesn't exist
pub async fn ensure_dir_exists(path: &std::path::Path) -> Result<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path).await?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Generates a unique task id, e.g. `batch_1a2b3c4d5e6f`.
pub fn generate_task_id(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &id[..12])
}
