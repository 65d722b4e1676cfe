//! Remote command pipeline assembly.

use std::collections::BTreeMap;
use std::path::Path;

/// Directory the entrypoint artifact is uploaded to.
pub const REMOTE_STAGING_DIR: &str = "/tmp";

/// Permission bits applied to the uploaded artifact.
pub const ARTIFACT_MODE: &str = "0755";

/// File cloud-init writes once first boot has finished.
pub const BOOT_FINISHED_MARKER: &str = "/var/lib/cloud/instance/boot-finished";

/// Remote path the artifact at `local` is staged under.
#[must_use]
pub fn staged_path(local: &Path) -> String {
    let name = local
        .file_name()
        .map_or_else(|| "entrypoint".into(), |n| n.to_string_lossy());
    format!("{REMOTE_STAGING_DIR}/{name}")
}

/// Shell loop that blocks until the boot-finished marker exists.
#[must_use]
pub fn boot_wait_step() -> String {
    format!(
        "while [ ! -f {BOOT_FINISHED_MARKER} ]; do echo 'Waiting for cloud-init...'; sleep 1; done"
    )
}

/// Quotes `value` for a POSIX shell.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Steps of a remote invocation, in execution order.
#[derive(Debug, Default)]
pub struct RemotePipeline<'a> {
    /// Path of the uploaded entrypoint, if any.
    pub artifact: Option<&'a str>,
    /// Wait for the boot marker before the artifact runs.
    pub wait_for_boot: bool,
    pub env: Option<&'a BTreeMap<String, String>>,
    pub command: Option<&'a str>,
}

impl RemotePipeline<'_> {
    /// Joins the steps with `&&` so a failing step aborts the rest.
    ///
    /// Order: boot wait (only with an artifact), environment exports,
    /// artifact, literal command. Returns `None` when there is nothing to run.
    #[must_use]
    pub fn assemble(&self) -> Option<String> {
        let mut steps = Vec::new();

        if self.artifact.is_some() && self.wait_for_boot {
            steps.push(boot_wait_step());
        }
        let has_work = self.artifact.is_some() || self.command.is_some_and(|c| !c.is_empty());
        if has_work && let Some(env) = self.env {
            for (key, value) in env {
                steps.push(format!("export {key}={}", shell_quote(value)));
            }
        }
        if let Some(artifact) = self.artifact {
            steps.push(artifact.to_string());
        }
        if let Some(command) = self.command.filter(|c| !c.is_empty()) {
            steps.push(command.to_string());
        }

        if has_work {
            Some(steps.join(" && "))
        } else {
            None
        }
    }
}
