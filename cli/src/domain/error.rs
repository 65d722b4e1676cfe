//! Typed domain error enums.
//!
//! This module has zero imports from `crate::infra`, `crate::commands`,
//! `crate::application`, `tokio`, `std::fs`, `std::process`, or `std::net`.
//! All error types implement `thiserror::Error` and convert to `anyhow::Error`
//! via the `?` operator.

use thiserror::Error;

// ── Resolution errors ─────────────────────────────────────────────────────────

/// Errors raised while turning operator input into provider identifiers.
///
/// Any of these aborts the whole run before an instance is created.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("unable to derive {kind} from: {entry} (expected KEY=VALUE)")]
    MalformedPair { kind: &'static str, entry: String },

    #[error("invalid environment variable name '{0}'")]
    InvalidEnvName(String),

    #[error("no {0} found matching your filters")]
    NoMatch(&'static str),

    #[error("no image constraint given: pass --ami-id, --ami or --ami-filter")]
    UnconstrainedImage,

    #[error("unable to look up {resource}: {message}")]
    Lookup {
        resource: &'static str,
        message: String,
    },

    #[error("unable to use key pair '{0}' without an identity file")]
    MissingIdentityFile(String),

    #[error("unable to use identity file '{0}' without a key pair name")]
    MissingKeyName(String),

    #[error("unable to read {what} {path}: {message}")]
    Unreadable {
        what: &'static str,
        path: String,
        message: String,
    },

    #[error("nothing to run: pass --entrypoint and/or a command")]
    NothingToRun,
}

// ── Provisioning errors ───────────────────────────────────────────────────────

/// Errors raised while launching one instance.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("instance launch failed: {0}")]
    Launch(String),

    /// The provider accepted the launch but reported no private address.
    /// `instance_id` is kept so the coordinator can still terminate it.
    #[error("instance {} was launched without a private address", instance_id.as_deref().unwrap_or("<unknown>"))]
    NoAddress { instance_id: Option<String> },
}

// ── Connectivity errors ───────────────────────────────────────────────────────

/// The readiness probe exhausted its attempt budget.
#[derive(Debug, Error)]
#[error("unable to connect to {host}:{port} after {attempts} attempts")]
pub struct ConnectivityTimeoutError {
    pub host: String,
    pub port: u16,
    pub attempts: u32,
}

// ── Execution errors ──────────────────────────────────────────────────────────

/// Errors raised by the remote executor.
///
/// A non-zero exit of the remote command is not an error; it is recorded as
/// the instance's completion code.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("file does not exist: {0}")]
    ArtifactMissing(String),

    #[error("unable to upload {0}: it's a directory")]
    ArtifactIsDirectory(String),

    #[error("error while copying {path}: {message}")]
    Upload { path: String, message: String },

    #[error("remote session to {host} failed: {message}")]
    Transport { host: String, message: String },

    #[error("remote command was terminated by a signal")]
    Signaled,

    #[error("empty remote command")]
    EmptyCommand,
}

// ── Teardown errors ───────────────────────────────────────────────────────────

/// Errors raised while releasing provider resources. Logged, never fatal.
#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("unable to terminate instance {instance_id}: {message}")]
    Terminate {
        instance_id: String,
        message: String,
    },

    #[error("unable to delete key pair {key_name}: {message}")]
    DeleteKeyPair { key_name: String, message: String },
}
