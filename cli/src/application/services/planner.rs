//! Launch planning: validate operator input and resolve everything the
//! instances share, before any provider resource is created.

use std::path::PathBuf;

use anyhow::Result;

use crate::application::ports::CloudProvider;
use crate::application::services::resolver::{self, ResolutionRequest};
use crate::application::services::{credentials, executor};
use crate::domain::filter::{parse_env_vars, parse_tags};
use crate::domain::{LaunchPlan, ResolutionError, SpotMarket, Workload};

/// Raw operator input for one run, after config defaults are applied.
#[derive(Debug, Clone, Default)]
pub struct PlanRequest {
    pub resolution: ResolutionRequest,
    pub key_name: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub instance_type: String,
    pub instance_profile: Option<String>,
    pub tags: Vec<String>,
    pub environment: Vec<String>,
    pub user_data_file: Option<PathBuf>,
    pub block_duration_minutes: Option<u32>,
    pub entrypoint: Option<PathBuf>,
    pub wait_for_boot: bool,
    pub command: Option<String>,
    pub keep_alive: bool,
}

/// Validate `request` and resolve the shared launch plan.
///
/// Local checks run first so a bad invocation never reaches the provider.
/// The plan's `key_name` is the operator's key, or empty until an
/// ephemeral key pair is created.
///
/// # Errors
///
/// Returns `ResolutionError` for an empty workload, a bad key pairing, a
/// malformed tag or variable, an unreadable file, or a failed lookup, and
/// `ExecutionError` for a missing entrypoint.
pub async fn prepare(provider: &impl CloudProvider, request: &PlanRequest) -> Result<LaunchPlan> {
    let workload = Workload {
        entrypoint: request.entrypoint.clone(),
        wait_for_boot: request.wait_for_boot,
        env: parse_env_vars(&request.environment)?,
        command: request.command.clone().filter(|c| !c.is_empty()),
    };
    if workload.is_empty() {
        return Err(ResolutionError::NothingToRun.into());
    }
    credentials::check_pairing(
        request.key_name.as_deref(),
        request.identity_file.as_deref(),
    )?;
    if let Some(entrypoint) = &workload.entrypoint {
        executor::check_artifact(entrypoint).await?;
    }
    let tags = parse_tags(&request.tags)?;
    let user_data = match &request.user_data_file {
        Some(path) => Some(tokio::fs::read_to_string(path).await.map_err(|e| {
            ResolutionError::Unreadable {
                what: "user data",
                path: path.display().to_string(),
                message: e.to_string(),
            }
        })?),
        None => None,
    };

    let identifiers = resolver::resolve_all(provider, &request.resolution).await?;

    Ok(LaunchPlan {
        identifiers,
        key_name: request.key_name.clone().unwrap_or_default(),
        instance_type: request.instance_type.clone(),
        instance_profile: request.instance_profile.clone(),
        tags,
        user_data,
        market: SpotMarket {
            block_duration_minutes: request.block_duration_minutes,
        },
        workload,
        keep_alive: request.keep_alive,
    })
}
