//! Infrastructure implementation of the `RemoteShell` port.
//!
//! `OpenSshShell<R>` drives the `ssh` and `scp` binaries through a
//! `CommandRunner`. The run's private key is written once to a private
//! temporary file and passed as the identity file to every session.

use std::io::Write;
use std::path::Path;
use std::process::ExitStatus;

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::application::ports::{CommandRunner, RemoteShell, StreamLabel};
use crate::domain::command::ARTIFACT_MODE;
use crate::domain::instance::Rgb;
use crate::domain::{ExecutionError, KeyPair};
use crate::infra::command_runner::DEFAULT_UPLOAD_TIMEOUT;

/// Exit status `ssh` itself uses for connection-level failures.
pub const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Options applied to every session: hosts are fresh, so host keys are never
/// known in advance, and sessions must never prompt.
const SSH_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "BatchMode=yes",
    "-o",
    "LogLevel=ERROR",
];

/// Remote shell over OpenSSH.
pub struct OpenSshShell<R: CommandRunner> {
    runner: R,
    user: String,
    port: u16,
    identity: NamedTempFile,
    colorize: bool,
}

impl<R: CommandRunner> OpenSshShell<R> {
    /// Open a session factory for `user` on `port` authenticated by `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity file cannot be written.
    pub fn new(runner: R, user: &str, port: u16, key: &KeyPair, colorize: bool) -> Result<Self> {
        let mut identity = tempfile::Builder::new()
            .prefix("ec2-runner-")
            .suffix(".pem")
            .tempfile()
            .context("cannot create identity file")?;
        identity
            .write_all(key.private_key.as_bytes())
            .context("cannot write identity file")?;
        if !key.private_key.ends_with('\n') {
            identity
                .write_all(b"\n")
                .context("cannot write identity file")?;
        }
        identity.flush().context("cannot write identity file")?;

        Ok(Self {
            runner,
            user: user.to_string(),
            port,
            identity,
            colorize,
        })
    }

    /// Path of the private identity file.
    #[must_use]
    pub fn identity_path(&self) -> &Path {
        self.identity.path()
    }

    fn destination(&self, host: &str) -> String {
        format!("{}@{host}", self.user)
    }

    /// Common `ssh`/`scp` arguments; `port_flag` is `-p` or `-P`.
    fn base_args(&self, port_flag: &str) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.identity.path().display().to_string(),
            port_flag.to_string(),
            self.port.to_string(),
        ];
        args.extend(SSH_OPTIONS.iter().map(|s| (*s).to_string()));
        args
    }

    /// Arguments for running `command` on `host`.
    #[must_use]
    pub fn ssh_args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = self.base_args("-p");
        args.push(self.destination(host));
        args.push(command.to_string());
        args
    }

    /// Arguments for copying `local` to `remote` on `host`.
    #[must_use]
    pub fn scp_args(&self, host: &str, local: &Path, remote: &str) -> Vec<String> {
        let mut args = self.base_args("-P");
        args.push(local.display().to_string());
        args.push(format!("{}:{remote}", self.destination(host)));
        args
    }
}

fn as_refs(args: &[String]) -> Vec<&str> {
    args.iter().map(String::as_str).collect()
}

fn check_captured(program: &str, output: &std::process::Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    anyhow::bail!("{program} failed: {}", stderr.trim())
}

/// Map the local `ssh` client's exit status to the remote completion code.
///
/// # Errors
///
/// Returns `ExecutionError::Transport` when `ssh` reports a connection-level
/// failure and `ExecutionError::Signaled` when the client was killed by a
/// signal.
pub fn completion_code(host: &str, status: ExitStatus) -> Result<i32> {
    match status.code() {
        Some(SSH_TRANSPORT_FAILURE) => Err(ExecutionError::Transport {
            host: host.to_string(),
            message: format!("ssh exited with status {SSH_TRANSPORT_FAILURE}"),
        }
        .into()),
        Some(code) => Ok(code),
        None => Err(ExecutionError::Signaled.into()),
    }
}

/// Copy `source` into `sink`, prefixing each line with `label` when set.
///
/// Lines are relayed as raw bytes; output need not be UTF-8.
async fn relay<S, W>(source: Option<S>, mut sink: W, label: Option<&str>) -> std::io::Result<()>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(mut source) = source else {
        return Ok(());
    };
    match label {
        None => {
            tokio::io::copy(&mut source, &mut sink).await?;
        }
        Some(prefix) => {
            let mut reader = BufReader::new(source);
            let mut line = Vec::new();
            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line).await? == 0 {
                    break;
                }
                sink.write_all(prefix.as_bytes()).await?;
                sink.write_all(b" ").await?;
                sink.write_all(&line).await?;
                if !line.ends_with(b"\n") {
                    sink.write_all(b"\n").await?;
                }
            }
        }
    }
    sink.flush().await
}

impl<R: CommandRunner> RemoteShell for OpenSshShell<R> {
    async fn upload(&self, host: &str, local: &Path, remote: &str) -> Result<()> {
        let scp = self.scp_args(host, local, remote);
        let output = self
            .runner
            .run_with_timeout("scp", &as_refs(&scp), DEFAULT_UPLOAD_TIMEOUT)
            .await?;
        check_captured("scp", &output)?;

        let chmod = self.ssh_args(host, &format!("chmod {ARTIFACT_MODE} {remote}"));
        let output = self.runner.run("ssh", &as_refs(&chmod)).await?;
        check_captured("ssh chmod", &output)
    }

    async fn execute(
        &self,
        host: &str,
        command: &str,
        label: Option<&StreamLabel>,
    ) -> Result<i32> {
        let args = self.ssh_args(host, command);
        let mut child = self
            .runner
            .spawn("ssh", &as_refs(&args))
            .with_context(|| format!("cannot open session to {host}"))?;

        // Only the unlabelled session is wired to the operator's stdin;
        // dropping the pipe gives every other session an immediate EOF.
        let feed = match (label, child.stdin.take()) {
            (None, Some(mut sink)) => Some(tokio::spawn(async move {
                let _ = tokio::io::copy(&mut tokio::io::stdin(), &mut sink).await;
            })),
            _ => None,
        };

        let prefix = label.map(|l| {
            let Rgb(r, g, b) = l.color;
            if self.colorize {
                l.prefix.truecolor(r, g, b).to_string()
            } else {
                l.prefix.clone()
            }
        });
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (status, out, err) = tokio::join!(
            child.wait(),
            relay(stdout, tokio::io::stdout(), prefix.as_deref()),
            relay(stderr, tokio::io::stderr(), prefix.as_deref()),
        );
        if let Some(feed) = feed {
            feed.abort();
        }
        if let Err(e) = out.and(err) {
            tracing::debug!(%host, error = %e, "output relay interrupted");
        }

        let status = status.with_context(|| format!("waiting for session to {host}"))?;
        completion_code(host, status)
    }
}
