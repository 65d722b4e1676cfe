//! Remote execution: upload the entrypoint, run the assembled pipeline, and
//! record the completion code.

use std::path::Path;

use anyhow::Result;

use crate::application::ports::{ProgressReporter, RemoteShell, StreamLabel};
use crate::domain::command::{RemotePipeline, staged_path};
use crate::domain::{ExecutionError, InstanceHandle, Workload};

/// Check that the entrypoint exists locally and is a regular file.
///
/// # Errors
///
/// Returns `ExecutionError` if the path is missing or is a directory.
pub async fn check_artifact(path: &Path) -> Result<()> {
    let display = path.display().to_string();
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|_| ExecutionError::ArtifactMissing(display.clone()))?;
    if metadata.is_dir() {
        return Err(ExecutionError::ArtifactIsDirectory(display).into());
    }
    Ok(())
}

/// Run `workload` on the instance behind `handle`.
///
/// A non-zero remote exit is recorded on `handle` and is not an error.
///
/// # Errors
///
/// Returns `ExecutionError` if the upload fails (nothing runs remotely in that
/// case) or the remote session fails at the transport level.
pub async fn execute(
    shell: &impl RemoteShell,
    handle: &mut InstanceHandle,
    workload: &Workload,
    reporter: &impl ProgressReporter,
) -> Result<()> {
    let host = handle.private_ip.clone();
    let label = format!("[{}]", handle.index);

    let artifact = match &workload.entrypoint {
        Some(local) => {
            check_artifact(local).await?;
            let remote = staged_path(local);
            reporter.step(&format!("{label} uploading {} to {remote}", local.display()));
            shell
                .upload(&host, local, &remote)
                .await
                .map_err(|e| ExecutionError::Upload {
                    path: local.display().to_string(),
                    message: format!("{e:#}"),
                })?;
            Some(remote)
        }
        None => None,
    };

    let pipeline = RemotePipeline {
        artifact: artifact.as_deref(),
        wait_for_boot: workload.wait_for_boot,
        env: Some(&workload.env),
        command: workload.command.as_deref(),
    };
    let command = pipeline.assemble().ok_or(ExecutionError::EmptyCommand)?;

    reporter.step(&format!("{label} executing: {command}"));
    let stream_label = handle.color.map(|color| StreamLabel {
        prefix: label.clone(),
        color,
    });
    let code = shell
        .execute(&host, &command, stream_label.as_ref())
        .await
        .map_err(|e| {
            if e.is::<ExecutionError>() {
                e
            } else {
                ExecutionError::Transport {
                    host: host.clone(),
                    message: format!("{e:#}"),
                }
                .into()
            }
        })?;

    handle.record_completion(code);
    if code == 0 {
        reporter.success(&format!("{label} command exited with code 0"));
    } else {
        reporter.warn(&format!("{label} command exited with code {code}"));
    }
    Ok(())
}
