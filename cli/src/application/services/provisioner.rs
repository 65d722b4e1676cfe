//! Instance provisioning: one spot launch per `InstanceSpec`.
//!
//! A single request/response exchange per call without polling or retry.

use anyhow::Result;

use crate::application::ports::{CloudProvider, LaunchRequest, ProgressReporter};
use crate::domain::{InstanceHandle, InstanceSpec, ProvisioningError};

/// Build the provider launch request for `spec`.
#[must_use]
pub fn launch_request<'a>(spec: &InstanceSpec<'a>) -> LaunchRequest<'a> {
    let plan = spec.plan;
    LaunchRequest {
        image_id: &plan.identifiers.image_id,
        instance_type: &plan.instance_type,
        key_name: &plan.key_name,
        subnet_id: &plan.identifiers.subnet_id,
        security_group_ids: &plan.identifiers.security_group_ids,
        tags: &plan.tags,
        instance_profile: plan.instance_profile.as_deref(),
        user_data: plan.user_data.as_deref(),
        market: plan.market,
    }
}

/// Launch the instance described by `spec`.
///
/// # Errors
///
/// Returns `ProvisioningError::Launch` if the provider rejects the request
/// and `ProvisioningError::NoAddress` if it returns no private address.
pub async fn launch(provider: &impl CloudProvider, spec: &InstanceSpec<'_>) -> Result<InstanceHandle> {
    let launched = provider
        .run_instance(&launch_request(spec))
        .await
        .map_err(|e| ProvisioningError::Launch(format!("{e:#}")))?;

    match (launched.instance_id, launched.private_ip) {
        (Some(instance_id), Some(private_ip)) => {
            tracing::info!(index = spec.index, %instance_id, %private_ip, "instance launched");
            Ok(InstanceHandle::new(spec.index, instance_id, private_ip))
        }
        (instance_id, _) => Err(ProvisioningError::NoAddress { instance_id }.into()),
    }
}

/// Record the realized spot price on `handle`. Best-effort: a missing price
/// record or a failed lookup leaves the price unset.
pub async fn record_spot_price(
    provider: &impl CloudProvider,
    handle: &mut InstanceHandle,
    reporter: &impl ProgressReporter,
) {
    match provider.describe_spot_price(&handle.instance_id).await {
        Ok(price) => handle.spot_price = price,
        Err(e) => {
            tracing::debug!(instance_id = %handle.instance_id, error = %e, "spot price lookup failed");
            reporter.warn(&format!(
                "[{}] unable to describe spot price for {}",
                handle.index, handle.instance_id
            ));
        }
    }
}
