//! Domain types for the optional defaults file.
//!
//! Pure data and defaults; loading lives in `infra::config`.

use serde::{Deserialize, Serialize};

// ── Built-in defaults ────────────────────────────────────────────────────────

pub const DEFAULT_USER: &str = "ec2-user";
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_INSTANCE_TYPE: &str = "t2.micro";
pub const DEFAULT_BLOCK_DURATION_MINUTES: u32 = 60;

// ── Config schema ────────────────────────────────────────────────────────────

/// Top-level configuration stored in `~/.ec2-runner/config.yaml`.
///
/// Every field is optional; flags on the command line take precedence.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Defaults for `run` flags.
    pub defaults: RunDefaults,
    /// Settings forwarded to the AWS command line.
    pub aws: AwsConfig,
}

/// Fallback values for `run` flags.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct RunDefaults {
    pub user: Option<String>,
    pub ssh_port: Option<u16>,
    pub instance_type: Option<String>,
    /// Spot block length; `0` launches plain spot without a block.
    pub block_duration_minutes: Option<u32>,
}

/// Region and named profile passed to `aws`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AwsConfig {
    pub region: Option<String>,
    pub profile: Option<String>,
}

impl RunnerConfig {
    #[must_use]
    pub fn user(&self, flag: Option<&str>) -> String {
        flag.or(self.defaults.user.as_deref())
            .unwrap_or(DEFAULT_USER)
            .to_string()
    }

    #[must_use]
    pub fn ssh_port(&self, flag: Option<u16>) -> u16 {
        flag.or(self.defaults.ssh_port).unwrap_or(DEFAULT_SSH_PORT)
    }

    #[must_use]
    pub fn instance_type(&self, flag: Option<&str>) -> String {
        flag.or(self.defaults.instance_type.as_deref())
            .unwrap_or(DEFAULT_INSTANCE_TYPE)
            .to_string()
    }

    /// Spot block length in minutes, `None` when disabled with `0`.
    #[must_use]
    pub fn block_duration(&self, flag: Option<u32>) -> Option<u32> {
        let minutes = flag
            .or(self.defaults.block_duration_minutes)
            .unwrap_or(DEFAULT_BLOCK_DURATION_MINUTES);
        (minutes > 0).then_some(minutes)
    }
}

// ── Unit tests ───────────────────────────────────────────────────────────────
