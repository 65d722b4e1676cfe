//! Instance domain types: launch plan, per-instance spec, runtime handle.
//!
//! The launch side (`LaunchPlan`, `InstanceSpec`) is fully populated before
//! any instance task starts and is read-only afterwards. The runtime side
//! (`InstanceHandle`) is created when a launch succeeds and is owned by the
//! instance task that launched it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Identifiers resolved once per run and shared by every instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentifiers {
    pub image_id: String,
    pub subnet_id: String,
    pub security_group_ids: Vec<String>,
}

/// Remote-access credential used by every instance of a run.
#[derive(Clone)]
pub struct KeyPair {
    /// Provider-registered key pair name.
    pub name: String,
    /// PEM private key material.
    pub private_key: String,
    /// Generated for this run; must be deleted from the provider afterwards.
    pub ephemeral: bool,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("name", &self.name)
            .field("private_key", &"<redacted>")
            .field("ephemeral", &self.ephemeral)
            .finish()
    }
}

/// What to run on each instance once it is reachable.
#[derive(Debug, Clone, Default)]
pub struct Workload {
    /// Local script uploaded and executed before the command.
    pub entrypoint: Option<PathBuf>,
    /// Wait for the cloud-init boot marker before the entrypoint.
    pub wait_for_boot: bool,
    /// Variables exported ahead of the entrypoint and command.
    pub env: BTreeMap<String, String>,
    /// Literal command line.
    pub command: Option<String>,
}

impl Workload {
    /// `true` when there is neither an entrypoint nor a command.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entrypoint.is_none() && self.command.as_deref().is_none_or(str::is_empty)
    }
}

/// Spot-market options for every launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpotMarket {
    /// Bounded interruption window (spot block). `None` launches plain spot.
    pub block_duration_minutes: Option<u32>,
}

/// Everything shared by the instances of one run.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub identifiers: ResolvedIdentifiers,
    pub key_name: String,
    pub instance_type: String,
    pub instance_profile: Option<String>,
    pub tags: BTreeMap<String, String>,
    /// Raw user-data script contents.
    pub user_data: Option<String>,
    pub market: SpotMarket,
    pub workload: Workload,
    /// Leave instances running after the workload finishes.
    pub keep_alive: bool,
}

/// Launch configuration for one instance (index 1..=N).
#[derive(Debug, Clone, Copy)]
pub struct InstanceSpec<'a> {
    pub index: usize,
    pub plan: &'a LaunchPlan,
}

impl InstanceSpec<'_> {
    /// Short label used in progress messages.
    #[must_use]
    pub fn label(&self) -> String {
        format!("[{}]", self.index)
    }
}

/// Builds one spec per requested instance, indexed from 1.
#[must_use]
pub fn instance_specs(plan: &LaunchPlan, count: usize) -> Vec<InstanceSpec<'_>> {
    (1..=count).map(|index| InstanceSpec { index, plan }).collect()
}

// ── Runtime record ────────────────────────────────────────────────────────────

/// An RGB display color for multiplexed output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

const PALETTE: [Rgb; 12] = [
    Rgb(0x3d, 0x8b, 0xd9),
    Rgb(0x2f, 0xa5, 0x6b),
    Rgb(0xc9, 0x7b, 0x25),
    Rgb(0x9b, 0x4d, 0xca),
    Rgb(0xd1, 0x4a, 0x6e),
    Rgb(0x1f, 0x9e, 0xa8),
    Rgb(0x8a, 0x9a, 0x1c),
    Rgb(0xb0, 0x5b, 0x3b),
    Rgb(0x55, 0x6b, 0xd8),
    Rgb(0x4c, 0xa3, 0x3a),
    Rgb(0xc2, 0x45, 0xb0),
    Rgb(0x7a, 0x7f, 0x8c),
];

/// Display color for the instance at `index`. The first instance is left
/// uncolored so a single-instance run streams untouched output.
#[must_use]
pub fn display_color(index: usize) -> Option<Rgb> {
    (index > 1).then(|| PALETTE[(index - 2) % PALETTE.len()])
}

/// Lifecycle stage of one instance task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStage {
    Provisioning,
    AwaitingReady,
    Executing,
    Terminating,
    Done,
}

impl fmt::Display for InstanceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Provisioning => "provisioning",
            Self::AwaitingReady => "awaiting ready",
            Self::Executing => "executing",
            Self::Terminating => "terminating",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Mutable runtime record of one launched instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub index: usize,
    pub instance_id: String,
    pub private_ip: String,
    /// Realized spot price, when the provider reports one.
    pub spot_price: Option<String>,
    /// Remote completion code; `None` until the workload has run.
    completion: Option<i32>,
    pub color: Option<Rgb>,
}

impl InstanceHandle {
    #[must_use]
    pub fn new(index: usize, instance_id: String, private_ip: String) -> Self {
        Self {
            index,
            instance_id,
            private_ip,
            spot_price: None,
            completion: None,
            color: display_color(index),
        }
    }

    /// Records the remote completion code. Only the first call takes effect.
    pub fn record_completion(&mut self, code: i32) {
        if self.completion.is_none() {
            self.completion = Some(code);
        }
    }

    #[must_use]
    pub fn completion(&self) -> Option<i32> {
        self.completion
    }
}

// ── Exit code policy ──────────────────────────────────────────────────────────

/// Exit code used when the operator interrupts the run.
pub const INTERRUPT_EXIT_CODE: i32 = 130;

/// Combines per-instance completion codes into the process exit code.
///
/// The result is the largest code across instances; an instance that never
/// produced a code (it failed before or during execution) counts as 1.
#[must_use]
pub fn authoritative_exit_code(completions: &[Option<i32>]) -> i32 {
    completions
        .iter()
        .map(|code| code.unwrap_or(1))
        .max()
        .unwrap_or(0)
}
