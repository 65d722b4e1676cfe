//! Domain layer: pure types and validation.
//!
//! This module has zero imports from `crate::infra`, `crate::commands`,
//! `crate::application`, `tokio`, `std::fs`, `std::process`, or `std::net`.
//! All functions are synchronous and take data in, returning data out.

pub mod command;
pub mod config;
pub mod error;
pub mod filter;
pub mod instance;

pub use config::RunnerConfig;
pub use error::{
    ConnectivityTimeoutError, ExecutionError, ProvisioningError, ResolutionError, TeardownError,
};
pub use filter::Filter;
pub use instance::{
    InstanceHandle, InstanceSpec, InstanceStage, KeyPair, LaunchPlan, ResolvedIdentifiers,
    SpotMarket, Workload,
};
