//! `ec2-runner run`: run a workload on ephemeral spot instances.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use crate::application::ports::{ConfigStore, ProgressReporter};
use crate::application::services::coordinator::{self, InstanceReport, RunContext, RunOutcome};
use crate::application::services::credentials;
use crate::application::services::planner::{self, PlanRequest};
use crate::application::services::readiness::ProbePolicy;
use crate::application::services::resolver::{
    ResolutionRequest, ResourceQuery, SecurityGroupQuery,
};
use crate::domain::instance::instance_specs;
use crate::domain::{LaunchPlan, RunnerConfig};
use crate::infra::aws::AwsCli;
use crate::infra::command_runner::TokioCommandRunner;
use crate::infra::config::YamlConfigStore;
use crate::infra::network::TokioNetworkProbe;
use crate::infra::ssh::OpenSshShell;
use crate::output::{OutputContext, TerminalReporter};

/// Arguments for the run command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// AMI name (wildcards allowed); the newest match is used
    #[arg(long)]
    pub ami: Option<String>,

    /// AMI id, overriding --ami and --ami-filter
    #[arg(long)]
    pub ami_id: Option<String>,

    /// KEY=VALUE filter for the AMI (repeatable)
    #[arg(long, value_name = "KEY=VALUE")]
    pub ami_filter: Vec<String>,

    /// Subnet name; the first match is used
    #[arg(long)]
    pub subnet: Option<String>,

    /// Subnet id, overriding --subnet and --subnet-filter
    #[arg(long)]
    pub subnet_id: Option<String>,

    /// KEY=VALUE filter for the subnet (repeatable)
    #[arg(long, value_name = "KEY=VALUE")]
    pub subnet_filter: Vec<String>,

    /// Security group name (repeatable)
    #[arg(long)]
    pub security_group: Vec<String>,

    /// Security group id, used as-is (repeatable)
    #[arg(long)]
    pub security_group_id: Vec<String>,

    /// KEY=VALUE filter for security groups (repeatable)
    #[arg(long, value_name = "KEY=VALUE")]
    pub security_group_filter: Vec<String>,

    /// Instance profile to attach
    #[arg(long)]
    pub instance_profile: Option<String>,

    /// Number of instances to run
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub count: u16,

    /// Existing key pair name; an ephemeral key pair is created when omitted
    #[arg(long)]
    pub ssh_key: Option<String>,

    /// SSH port [default: 22]
    #[arg(long)]
    pub ssh_port: Option<u16>,

    /// SSH user [default: ec2-user]
    #[arg(long)]
    pub user: Option<String>,

    /// Private key file for --ssh-key
    #[arg(short, long, alias = "identify-file")]
    pub identity_file: Option<PathBuf>,

    /// KEY=VALUE tag for the instance and its volume (repeatable)
    #[arg(long, value_name = "KEY=VALUE")]
    pub tag: Vec<String>,

    /// Instance type [default: t2.micro]
    #[arg(short = 't', long = "type")]
    pub instance_type: Option<String>,

    /// KEY=VALUE variable exported before the entrypoint and command (repeatable)
    #[arg(long, value_name = "KEY=VALUE")]
    pub environment: Vec<String>,

    /// User-data script passed to the instance
    #[arg(long)]
    pub user_data: Option<PathBuf>,

    /// Local script uploaded and executed before the command
    #[arg(long)]
    pub entrypoint: Option<PathBuf>,

    /// Do not wait for cloud-init to finish before the entrypoint
    #[arg(long)]
    pub no_wait_cloud_init: bool,

    /// Leave instances running after the workload finishes
    #[arg(long)]
    pub no_terminate: bool,

    /// Show the instances that would start without starting them
    #[arg(long)]
    pub dry_run: bool,

    /// Spot block duration in minutes, 0 for plain spot [default: 60]
    #[arg(long)]
    pub block_duration: Option<u32>,

    /// AWS region passed to the aws CLI
    #[arg(long)]
    pub region: Option<String>,

    /// AWS profile passed to the aws CLI
    #[arg(long)]
    pub profile: Option<String>,

    /// Command to run on every instance
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl RunArgs {
    /// Build the plan request, filling unset flags from `config`.
    #[must_use]
    pub fn plan_request(&self, config: &RunnerConfig) -> PlanRequest {
        let command = (!self.command.is_empty()).then(|| self.command.join(" "));
        PlanRequest {
            resolution: ResolutionRequest {
                image: ResourceQuery {
                    id: self.ami_id.clone(),
                    name: self.ami.clone(),
                    filters: self.ami_filter.clone(),
                },
                subnet: ResourceQuery {
                    id: self.subnet_id.clone(),
                    name: self.subnet.clone(),
                    filters: self.subnet_filter.clone(),
                },
                security_groups: SecurityGroupQuery {
                    ids: self.security_group_id.clone(),
                    names: self.security_group.clone(),
                    filters: self.security_group_filter.clone(),
                },
            },
            key_name: self.ssh_key.clone(),
            identity_file: self.identity_file.clone(),
            instance_type: config.instance_type(self.instance_type.as_deref()),
            instance_profile: self.instance_profile.clone(),
            tags: self.tag.clone(),
            environment: self.environment.clone(),
            user_data_file: self.user_data.clone(),
            block_duration_minutes: config.block_duration(self.block_duration),
            entrypoint: self.entrypoint.clone(),
            wait_for_boot: !self.no_wait_cloud_init,
            command,
            keep_alive: self.no_terminate,
        }
    }

    /// Merge `--region`/`--profile` over the config file's `aws` section.
    fn apply_aws_overrides(&self, config: &mut RunnerConfig) {
        if let Some(region) = &self.region {
            config.aws.region = Some(region.clone());
        }
        if let Some(profile) = &self.profile {
            config.aws.profile = Some(profile.clone());
        }
    }
}

/// Run `ec2-runner run` and return the process exit code.
///
/// # Errors
///
/// Returns an error if validation, resolution or key provisioning fails.
/// Nothing is left running in that case.
pub async fn run(args: &RunArgs, ctx: &OutputContext) -> Result<i32> {
    let mut config = YamlConfigStore.load()?;
    args.apply_aws_overrides(&mut config);

    let provider = AwsCli::new(TokioCommandRunner::default(), &config.aws);
    let reporter = TerminalReporter::new(ctx);

    let request = args.plan_request(&config);
    let mut plan = planner::prepare(&provider, &request).await?;
    let count = usize::from(args.count);

    if args.dry_run {
        print_dry_run(&plan, count, ctx);
        return Ok(0);
    }

    let key = credentials::provision_key_pair(
        &provider,
        request.key_name.as_deref(),
        request.identity_file.as_deref(),
    )
    .await?;
    plan.key_name.clone_from(&key.name);

    let shell = match OpenSshShell::new(
        TokioCommandRunner::default(),
        &config.user(args.user.as_deref()),
        config.ssh_port(args.ssh_port),
        &key,
        ctx.colors_enabled(),
    ) {
        Ok(shell) => shell,
        Err(e) => {
            credentials::destroy_key_pair(&provider, &key, &reporter).await;
            return Err(e);
        }
    };

    let run_ctx = RunContext {
        provider: &provider,
        probe: &TokioNetworkProbe,
        shell: &shell,
        reporter: &reporter,
        ssh_port: config.ssh_port(args.ssh_port),
        probe_policy: ProbePolicy::default(),
    };
    let outcome = coordinator::run_all(&run_ctx, &plan, &key, count, interrupt()).await;
    report_outcome(&outcome, &reporter);
    Ok(outcome.exit_code())
}

/// Resolves on Ctrl-C. Stays pending if the handler cannot be installed.
async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for interrupts");
        std::future::pending::<()>().await;
    }
}

/// Print what each instance would be launched with.
fn print_dry_run(plan: &LaunchPlan, count: usize, ctx: &OutputContext) {
    let key_name = if plan.key_name.is_empty() {
        "(ephemeral, created at launch)"
    } else {
        plan.key_name.as_str()
    };
    for spec in instance_specs(plan, count) {
        ctx.header(&format!("Instance {}", spec.label()));
        ctx.kv("AMI", &plan.identifiers.image_id);
        ctx.kv("Subnet", &plan.identifiers.subnet_id);
        ctx.kv("Security groups", &plan.identifiers.security_group_ids.join(", "));
        ctx.kv("Type", &plan.instance_type);
        ctx.kv("Key pair", key_name);
        if let Some(profile) = &plan.instance_profile {
            ctx.kv("Instance profile", profile);
        }
        if let Some(minutes) = plan.market.block_duration_minutes {
            ctx.kv("Spot block", &format!("{minutes} minutes"));
        }
        for (key, value) in &plan.tags {
            ctx.kv("Tag", &format!("{key}={value}"));
        }
        if let Some(entrypoint) = &plan.workload.entrypoint {
            ctx.kv("Entrypoint", &entrypoint.display().to_string());
        }
        if let Some(command) = &plan.workload.command {
            ctx.kv("Command", command);
        }
    }
}

fn report_outcome(outcome: &RunOutcome, reporter: &impl ProgressReporter) {
    match outcome {
        RunOutcome::Completed { reports, exit_code } => {
            let failed = reports.iter().filter(|r| r.failure.is_some()).count();
            if failed > 0 {
                reporter.warn(&format!(
                    "{failed} of {} instances failed before completing",
                    reports.len()
                ));
            }
            for report in reports {
                log_report(report);
            }
            tracing::info!(exit_code, "all instances done");
        }
        RunOutcome::Interrupted { terminated } => {
            reporter.warn(&format!(
                "interrupted: terminated {} instance(s)",
                terminated.len()
            ));
        }
    }
}

fn log_report(report: &InstanceReport) {
    match &report.failure {
        Some(failure) => tracing::debug!(
            index = report.index,
            stage = %failure.stage,
            error = %failure.message,
            "instance report"
        ),
        None => tracing::debug!(
            index = report.index,
            completion = ?report.completion(),
            "instance report"
        ),
    }
}
