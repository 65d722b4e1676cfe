//! Port trait definitions for the Application layer.
//!
//! Ports are the interfaces (contracts) that infrastructure must fulfill.
//! This file imports only from `crate::domain`, never from `crate::infra`,
//! `crate::commands`, or `crate::output`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use anyhow::Result;

use crate::domain::instance::Rgb;
use crate::domain::{Filter, RunnerConfig, SpotMarket};

// ── Value Types ───────────────────────────────────────────────────────────────

/// An image returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub image_id: String,
    /// RFC 3339 creation timestamp as reported by the provider.
    pub creation_date: String,
}

/// Parameters for launching exactly one spot instance.
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    pub image_id: &'a str,
    pub instance_type: &'a str,
    pub key_name: &'a str,
    pub subnet_id: &'a str,
    pub security_group_ids: &'a [String],
    /// Applied to the instance and its volume; skipped when empty.
    pub tags: &'a BTreeMap<String, String>,
    pub instance_profile: Option<&'a str>,
    pub user_data: Option<&'a str>,
    pub market: SpotMarket,
}

/// What the provider reported for a launch request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchedInstance {
    pub instance_id: Option<String>,
    pub private_ip: Option<String>,
}

/// Provider-side result of a termination request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The instance moved to the given state (e.g. `shutting-down`).
    Transitioned(String),
    /// The provider no longer knows the instance.
    AlreadyGone,
}

// ── Cloud Provider Port ───────────────────────────────────────────────────────

/// Cloud provider operations needed for one ephemeral run.
///
/// A single handle is constructed once and passed by reference into every
/// service that talks to the provider.
#[allow(async_fn_in_trait)]
pub trait CloudProvider {
    /// List images matching all `filters`.
    async fn describe_images(&self, filters: &[Filter]) -> Result<Vec<ImageRecord>>;
    /// List subnet ids matching all `filters`, in provider order.
    async fn describe_subnets(&self, filters: &[Filter]) -> Result<Vec<String>>;
    /// List security-group ids matching all `filters`.
    async fn describe_security_groups(&self, filters: &[Filter]) -> Result<Vec<String>>;
    /// Create a key pair and return its private key material.
    async fn create_key_pair(&self, name: &str) -> Result<String>;
    /// Delete a key pair.
    async fn delete_key_pair(&self, name: &str) -> Result<()>;
    /// Launch one instance.
    async fn run_instance(&self, request: &LaunchRequest<'_>) -> Result<LaunchedInstance>;
    /// Look up the realized spot price of an instance, if any.
    async fn describe_spot_price(&self, instance_id: &str) -> Result<Option<String>>;
    /// Terminate an instance. Must tolerate an instance that no longer exists.
    async fn terminate_instance(&self, instance_id: &str) -> Result<Termination>;
}

// ── Command Runner Port ───────────────────────────────────────────────────────

/// Abstracts process execution so infrastructure can be swapped or mocked.
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    /// Run a program and capture its output.
    ///
    /// Implementations should delegate to `run_with_timeout` using the
    /// instance's configured default timeout.
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output>;
    /// Run a program with a custom timeout override.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned or exceeds `timeout`.
    /// On timeout, the child process must be killed (not left orphaned).
    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Output>;
    /// Spawn a program with all three standard streams piped.
    ///
    /// The child is killed when the returned handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned.
    fn spawn(&self, program: &str, args: &[&str]) -> Result<tokio::process::Child>;
}

// ── Network Probe Port ────────────────────────────────────────────────────────

/// Abstracts bare TCP reachability checks so the readiness probe can be
/// tested without real network access.
#[allow(async_fn_in_trait)]
pub trait NetworkProbe {
    /// Open (and immediately close) a TCP connection to `host:port`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is refused or `timeout` elapses.
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<()>;
}

// ── Remote Shell Port ─────────────────────────────────────────────────────────

/// How a session's output is labelled when several instances share a terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLabel {
    pub prefix: String,
    pub color: Rgb,
}

/// Authenticated remote shell to an instance.
#[allow(async_fn_in_trait)]
pub trait RemoteShell {
    /// Copy `local` to `remote` on `host` and make it executable.
    async fn upload(&self, host: &str, local: &Path, remote: &str) -> Result<()>;
    /// Run `command` on `host`, streaming the caller's stdio, and return the
    /// remote exit status.
    ///
    /// # Errors
    ///
    /// Returns an error only for session or transport failures; a non-zero
    /// remote exit is returned as `Ok(code)`.
    async fn execute(&self, host: &str, command: &str, label: Option<&StreamLabel>)
    -> Result<i32>;
}

// ── Progress Reporting Port ───────────────────────────────────────────────────

/// Abstracts progress reporting so services can emit events without
/// depending on the Presentation layer. Sync trait.
pub trait ProgressReporter {
    /// Emit an in-progress step message.
    fn step(&self, message: &str);
    /// Emit a success message.
    fn success(&self, message: &str);
    /// Emit a warning message.
    fn warn(&self, message: &str);
    /// Emit an error message. Never suppressed.
    fn error(&self, message: &str);
}

// ── Configuration Port ────────────────────────────────────────────────────────

/// Abstracts loading of the defaults file.
pub trait ConfigStore {
    /// Load the config, returning defaults when no file exists.
    fn load(&self) -> Result<RunnerConfig>;
    /// Location of the config file.
    fn path(&self) -> Result<PathBuf>;
}
