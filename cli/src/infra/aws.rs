//! Infrastructure implementation of the `CloudProvider` port.
//!
//! `AwsCli<R>` routes every EC2 call through the `aws` CLI via a
//! `CommandRunner` and parses its JSON output.

use std::process::Output;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::application::ports::{
    CloudProvider, CommandRunner, ImageRecord, LaunchRequest, LaunchedInstance, Termination,
};
use crate::domain::Filter;
use crate::domain::config::AwsConfig;

/// Error code the EC2 API returns for an unknown instance id.
pub const INSTANCE_NOT_FOUND: &str = "InvalidInstanceID.NotFound";

/// Infrastructure adapter that routes all EC2 calls through a `CommandRunner`.
///
/// Generic over `R: CommandRunner` so that tests can inject a mock runner
/// without spawning real processes.
pub struct AwsCli<R: CommandRunner> {
    runner: R,
    region: Option<String>,
    profile: Option<String>,
}

impl<R: CommandRunner> AwsCli<R> {
    /// Create a provider handle; `aws` settings are forwarded as `--region`
    /// and `--profile` when set.
    pub fn new(runner: R, aws: &AwsConfig) -> Self {
        Self {
            runner,
            region: aws.region.clone(),
            profile: aws.profile.clone(),
        }
    }

    /// Run `aws ec2 <operation> <args> --output json` and return stdout.
    async fn ec2(&self, operation: &str, args: &[String]) -> Result<Vec<u8>> {
        let full = self.ec2_args(operation, args);
        let refs: Vec<&str> = full.iter().map(String::as_str).collect();
        let output = self
            .runner
            .run("aws", &refs)
            .await
            .with_context(|| format!("aws ec2 {operation}"))?;
        check_status(operation, output)
    }

    fn ec2_args(&self, operation: &str, args: &[String]) -> Vec<String> {
        let mut full = vec!["ec2".to_string(), operation.to_string()];
        full.extend_from_slice(args);
        full.extend(["--output".to_string(), "json".to_string()]);
        if let Some(region) = &self.region {
            full.extend(["--region".to_string(), region.clone()]);
        }
        if let Some(profile) = &self.profile {
            full.extend(["--profile".to_string(), profile.clone()]);
        }
        full
    }
}

fn check_status(operation: &str, output: Output) -> Result<Vec<u8>> {
    if output.status.success() {
        return Ok(output.stdout);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    anyhow::bail!("aws ec2 {operation} failed: {}", stderr.trim())
}

fn filter_args(filters: &[Filter]) -> Result<Vec<String>> {
    if filters.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![
        "--filters".to_string(),
        serde_json::to_string(filters).context("encoding filters")?,
    ])
}

// ── Request encoding ──────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkInterface<'a> {
    device_index: u32,
    associate_public_ip_address: bool,
    subnet_id: &'a str,
    groups: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct MarketOptions {
    market_type: &'static str,
    spot_options: SpotOptions,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SpotOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    block_duration_minutes: Option<u32>,
    instance_interruption_behavior: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct TagSpecification<'a> {
    resource_type: &'static str,
    tags: &'a [Tag<'a>],
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Tag<'a> {
    key: &'a str,
    value: &'a str,
}

/// Arguments for `aws ec2 run-instances` launching exactly one spot instance
/// with a private address only.
///
/// # Errors
///
/// Returns an error if a JSON-valued argument cannot be encoded.
pub fn run_instances_args(request: &LaunchRequest<'_>) -> Result<Vec<String>> {
    let interfaces = [NetworkInterface {
        device_index: 0,
        associate_public_ip_address: false,
        subnet_id: request.subnet_id,
        groups: request.security_group_ids,
    }];
    let market = MarketOptions {
        market_type: "spot",
        spot_options: SpotOptions {
            block_duration_minutes: request.market.block_duration_minutes,
            instance_interruption_behavior: "terminate",
        },
    };

    let mut args = vec![
        "--image-id".to_string(),
        request.image_id.to_string(),
        "--instance-type".to_string(),
        request.instance_type.to_string(),
        "--key-name".to_string(),
        request.key_name.to_string(),
        "--count".to_string(),
        "1".to_string(),
        "--network-interfaces".to_string(),
        serde_json::to_string(&interfaces).context("encoding network interfaces")?,
        "--instance-initiated-shutdown-behavior".to_string(),
        "terminate".to_string(),
        "--instance-market-options".to_string(),
        serde_json::to_string(&market).context("encoding market options")?,
    ];

    if !request.tags.is_empty() {
        let tags: Vec<Tag<'_>> = request
            .tags
            .iter()
            .map(|(key, value)| Tag { key, value })
            .collect();
        let specs = [
            TagSpecification {
                resource_type: "instance",
                tags: &tags,
            },
            TagSpecification {
                resource_type: "volume",
                tags: &tags,
            },
        ];
        args.push("--tag-specifications".to_string());
        args.push(serde_json::to_string(&specs).context("encoding tag specifications")?);
    }
    if let Some(profile) = request.instance_profile {
        args.push("--iam-instance-profile".to_string());
        args.push(format!("Name={profile}"));
    }
    if let Some(user_data) = request.user_data {
        args.push("--user-data".to_string());
        args.push(user_data.to_string());
    }
    Ok(args)
}

// ── Response decoding ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImagesResponse {
    #[serde(default)]
    images: Vec<ImageEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageEntry {
    image_id: String,
    #[serde(default)]
    creation_date: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SubnetsResponse {
    #[serde(default)]
    subnets: Vec<SubnetEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SubnetEntry {
    subnet_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecurityGroupsResponse {
    #[serde(default)]
    security_groups: Vec<SecurityGroupEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecurityGroupEntry {
    group_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeyPairResponse {
    key_material: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReservationResponse {
    #[serde(default)]
    instances: Vec<InstanceEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceEntry {
    instance_id: Option<String>,
    private_ip_address: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpotRequestsResponse {
    #[serde(default)]
    spot_instance_requests: Vec<SpotRequestEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpotRequestEntry {
    actual_block_hourly_price: Option<String>,
    spot_price: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TerminateResponse {
    #[serde(default)]
    terminating_instances: Vec<StateChange>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StateChange {
    current_state: InstanceState,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceState {
    name: String,
}

fn decode<T: for<'de> Deserialize<'de>>(operation: &str, stdout: &[u8]) -> Result<T> {
    serde_json::from_slice(stdout).with_context(|| format!("parsing aws ec2 {operation} output"))
}

impl<R: CommandRunner> CloudProvider for AwsCli<R> {
    async fn describe_images(&self, filters: &[Filter]) -> Result<Vec<ImageRecord>> {
        let stdout = self.ec2("describe-images", &filter_args(filters)?).await?;
        let response: ImagesResponse = decode("describe-images", &stdout)?;
        Ok(response
            .images
            .into_iter()
            .map(|image| ImageRecord {
                image_id: image.image_id,
                creation_date: image.creation_date,
            })
            .collect())
    }

    async fn describe_subnets(&self, filters: &[Filter]) -> Result<Vec<String>> {
        let stdout = self.ec2("describe-subnets", &filter_args(filters)?).await?;
        let response: SubnetsResponse = decode("describe-subnets", &stdout)?;
        Ok(response.subnets.into_iter().map(|s| s.subnet_id).collect())
    }

    async fn describe_security_groups(&self, filters: &[Filter]) -> Result<Vec<String>> {
        let stdout = self
            .ec2("describe-security-groups", &filter_args(filters)?)
            .await?;
        let response: SecurityGroupsResponse = decode("describe-security-groups", &stdout)?;
        Ok(response
            .security_groups
            .into_iter()
            .map(|g| g.group_id)
            .collect())
    }

    async fn create_key_pair(&self, name: &str) -> Result<String> {
        let stdout = self
            .ec2("create-key-pair", &["--key-name".to_string(), name.to_string()])
            .await?;
        let response: KeyPairResponse = decode("create-key-pair", &stdout)?;
        Ok(response.key_material)
    }

    async fn delete_key_pair(&self, name: &str) -> Result<()> {
        self.ec2("delete-key-pair", &["--key-name".to_string(), name.to_string()])
            .await?;
        Ok(())
    }

    async fn run_instance(&self, request: &LaunchRequest<'_>) -> Result<LaunchedInstance> {
        let stdout = self
            .ec2("run-instances", &run_instances_args(request)?)
            .await?;
        let response: ReservationResponse = decode("run-instances", &stdout)?;
        Ok(response
            .instances
            .into_iter()
            .next()
            .map(|i| LaunchedInstance {
                instance_id: i.instance_id,
                private_ip: i.private_ip_address,
            })
            .unwrap_or_default())
    }

    async fn describe_spot_price(&self, instance_id: &str) -> Result<Option<String>> {
        let filters = filter_args(&[Filter::single("instance-id", instance_id)])?;
        let stdout = self
            .ec2("describe-spot-instance-requests", &filters)
            .await?;
        let response: SpotRequestsResponse = decode("describe-spot-instance-requests", &stdout)?;
        Ok(response
            .spot_instance_requests
            .into_iter()
            .next()
            .and_then(|r| r.actual_block_hourly_price.or(r.spot_price)))
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<Termination> {
        let args = ["--instance-ids".to_string(), instance_id.to_string()];
        let stdout = match self.ec2("terminate-instances", &args).await {
            Ok(stdout) => stdout,
            Err(e) if format!("{e:#}").contains(INSTANCE_NOT_FOUND) => {
                return Ok(Termination::AlreadyGone);
            }
            Err(e) => return Err(e),
        };
        let response: TerminateResponse = decode("terminate-instances", &stdout)?;
        Ok(response
            .terminating_instances
            .into_iter()
            .next()
            .map_or(Termination::AlreadyGone, |change| {
                Termination::Transitioned(change.current_state.name)
            }))
    }
}
