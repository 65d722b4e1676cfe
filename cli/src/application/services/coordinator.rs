//! Lifecycle coordination across every instance of a run.
//!
//! Each instance runs `Provisioning → AwaitingReady → Executing →
//! Terminating → Done`; a failure in any stage jumps straight to
//! `Terminating` and never affects sibling instances. All instance futures
//! are driven concurrently and raced against the interrupt future in a
//! single `select!`. An interrupt cancels each task's post-launch work, so
//! normal completion and interrupt cleanup share one teardown path.

use std::collections::HashSet;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use futures_util::future::join_all;
use tokio::sync::watch;

use crate::application::ports::{
    CloudProvider, NetworkProbe, ProgressReporter, RemoteShell, Termination,
};
use crate::application::services::readiness::{self, ProbePolicy};
use crate::application::services::{credentials, executor, provisioner};
use crate::domain::instance::{INTERRUPT_EXIT_CODE, authoritative_exit_code, instance_specs};
use crate::domain::{
    InstanceHandle, InstanceSpec, InstanceStage, KeyPair, LaunchPlan, ProvisioningError,
    TeardownError,
};

/// Collaborators shared read-only by every instance task.
pub struct RunContext<'a, P, N, S, R> {
    pub provider: &'a P,
    pub probe: &'a N,
    pub shell: &'a S,
    pub reporter: &'a R,
    pub ssh_port: u16,
    pub probe_policy: ProbePolicy,
}

/// Where and why an instance task stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: InstanceStage,
    pub message: String,
}

/// Final record of one instance task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceReport {
    pub index: usize,
    pub stage: InstanceStage,
    /// Present once the provider assigned an id and address.
    pub handle: Option<InstanceHandle>,
    pub failure: Option<StageFailure>,
}

impl InstanceReport {
    fn new(index: usize) -> Self {
        Self {
            index,
            stage: InstanceStage::Provisioning,
            handle: None,
            failure: None,
        }
    }

    /// Remote completion code, if the workload ran.
    #[must_use]
    pub fn completion(&self) -> Option<i32> {
        self.handle.as_ref().and_then(InstanceHandle::completion)
    }

    fn fail(&mut self, err: &anyhow::Error, reporter: &impl ProgressReporter) {
        let message = format!("{err:#}");
        reporter.error(&format!("[{}] {} failed: {message}", self.index, self.stage));
        tracing::warn!(index = self.index, stage = %self.stage, error = %message, "instance task failed");
        self.failure = Some(StageFailure {
            stage: self.stage,
            message,
        });
    }

    fn interrupt(&mut self) {
        tracing::info!(index = self.index, stage = %self.stage, "instance task interrupted");
        self.failure = Some(StageFailure {
            stage: self.stage,
            message: "interrupted".to_string(),
        });
    }

    fn advance(&mut self, stage: InstanceStage) {
        tracing::info!(index = self.index, from = %self.stage, to = %stage, "instance stage");
        self.stage = stage;
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every instance task reached `Done`.
    Completed {
        reports: Vec<InstanceReport>,
        exit_code: i32,
    },
    /// The interrupt fired first; `terminated` lists every instance whose
    /// termination was answered during the run.
    Interrupted { terminated: Vec<String> },
}

impl RunOutcome {
    /// Process exit code for this outcome.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed { exit_code, .. } => *exit_code,
            Self::Interrupted { .. } => INTERRUPT_EXIT_CODE,
        }
    }
}

// ── Teardown ──────────────────────────────────────────────────────────────────

/// Idempotent cleanup primitives shared by the instance tasks and the
/// interrupt path.
///
/// Every instance id is terminated at most once and the ephemeral key pair
/// is deleted at most once, whichever path gets there first. A termination
/// whose future is dropped before the provider answers releases its claim,
/// so a later call issues it again.
pub struct Teardown<'a, P, R> {
    provider: &'a P,
    reporter: &'a R,
    key: &'a KeyPair,
    keep_alive: bool,
    launched: Mutex<Vec<String>>,
    /// Ids with a termination in flight or answered.
    claimed: Mutex<HashSet<String>>,
    /// Ids whose termination request was answered, in answer order.
    settled: Mutex<Vec<String>>,
    key_destroyed: AtomicBool,
}

/// Claim on one instance's termination; released on drop unless settled.
struct TerminationClaim<'s> {
    claimed: &'s Mutex<HashSet<String>>,
    instance_id: &'s str,
    settled: bool,
}

impl Drop for TerminationClaim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.claimed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(self.instance_id);
        }
    }
}

impl<'a, P: CloudProvider, R: ProgressReporter> Teardown<'a, P, R> {
    #[must_use]
    pub fn new(provider: &'a P, reporter: &'a R, key: &'a KeyPair, keep_alive: bool) -> Self {
        Self {
            provider,
            reporter,
            key,
            keep_alive,
            launched: Mutex::new(Vec::new()),
            claimed: Mutex::new(HashSet::new()),
            settled: Mutex::new(Vec::new()),
            key_destroyed: AtomicBool::new(false),
        }
    }

    /// Track a launched instance so the interrupt path can find it.
    pub fn register(&self, instance_id: &str) {
        self.launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(instance_id.to_string());
    }

    /// Terminate `instance_id` unless it is kept alive or already handled.
    ///
    /// Returns `true` if this call's termination request was answered.
    pub async fn terminate(&self, instance_id: &str) -> bool {
        if self.keep_alive {
            self.reporter
                .warn(&format!("leaving instance {instance_id} running (--no-terminate)"));
            return false;
        }
        let first = self
            .claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance_id.to_string());
        if !first {
            return false;
        }
        let mut claim = TerminationClaim {
            claimed: &self.claimed,
            instance_id,
            settled: false,
        };

        let result = self.provider.terminate_instance(instance_id).await;
        claim.settled = true;
        self.settled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(instance_id.to_string());

        match result {
            Ok(Termination::Transitioned(state)) => {
                self.reporter
                    .success(&format!("instance {instance_id} {state}"));
            }
            Ok(Termination::AlreadyGone) => {
                self.reporter
                    .success(&format!("instance {instance_id} already terminated"));
            }
            Err(e) => {
                let err = TeardownError::Terminate {
                    instance_id: instance_id.to_string(),
                    message: format!("{e:#}"),
                };
                tracing::warn!(error = %err, "termination failed");
                self.reporter.error(&err.to_string());
            }
        }
        true
    }

    /// Terminate every registered instance. Returns the ids this call
    /// terminated.
    pub async fn terminate_all(&self) -> Vec<String> {
        let ids = self
            .launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let issued = join_all(ids.iter().map(|id| self.terminate(id))).await;
        ids.into_iter()
            .zip(issued)
            .filter_map(|(id, issued)| issued.then_some(id))
            .collect()
    }

    /// Ids whose termination request was answered so far, sorted.
    #[must_use]
    pub fn settled(&self) -> Vec<String> {
        let mut ids = self
            .settled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        ids.sort();
        ids
    }

    /// Delete the ephemeral key pair, at most once per run.
    pub async fn destroy_key(&self) {
        if !self.key.ephemeral || self.key_destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        credentials::destroy_key_pair(self.provider, self.key, self.reporter).await;
    }
}

// ── Coordinator ───────────────────────────────────────────────────────────────

/// Run `count` instances of `plan` to completion, or until `interrupt` fires.
///
/// On normal completion every instance has already been terminated by its
/// own task; the ephemeral key is then deleted. On interrupt every task
/// abandons its readiness wait or remote session and terminates its own
/// instance. A launch already sent to the provider is allowed to finish so
/// the instance it creates is terminated too. Registered instances are then
/// swept once more and the key is deleted.
pub async fn run_all<P, N, S, R>(
    ctx: &RunContext<'_, P, N, S, R>,
    plan: &LaunchPlan,
    key: &KeyPair,
    count: usize,
    interrupt: impl Future<Output = ()>,
) -> RunOutcome
where
    P: CloudProvider,
    N: NetworkProbe,
    S: RemoteShell,
    R: ProgressReporter,
{
    let teardown = Teardown::new(ctx.provider, ctx.reporter, key, plan.keep_alive);
    let (cancel, cancelled) = watch::channel(false);
    let tasks = instance_specs(plan, count)
        .into_iter()
        .map(|spec| run_instance(ctx, &teardown, spec, cancelled.clone()));
    let mut joined = pin!(join_all(tasks));

    let finished = tokio::select! {
        reports = &mut joined => Some(reports),
        () = interrupt => None,
    };

    if let Some(reports) = finished {
        teardown.destroy_key().await;
        let completions: Vec<Option<i32>> =
            reports.iter().map(InstanceReport::completion).collect();
        let exit_code = authoritative_exit_code(&completions);
        tracing::info!(exit_code, "run completed");
        return RunOutcome::Completed { reports, exit_code };
    }

    ctx.reporter.warn("interrupted: tearing down every instance");
    cancel.send_replace(true);
    joined.await;
    teardown.terminate_all().await;
    teardown.destroy_key().await;
    let terminated = teardown.settled();
    tracing::info!(terminated = terminated.len(), "run interrupted");
    RunOutcome::Interrupted { terminated }
}

/// Run `work` unless the run is cancelled first.
async fn unless_cancelled<T>(
    cancelled: &mut watch::Receiver<bool>,
    work: impl Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancelled.wait_for(|cancelled| *cancelled) => None,
        value = work => Some(value),
    }
}

/// Drive one instance through its lifecycle.
///
/// The launch itself is never abandoned: once the provider may have created
/// an instance, the task lives long enough to terminate it.
async fn run_instance<P, N, S, R>(
    ctx: &RunContext<'_, P, N, S, R>,
    teardown: &Teardown<'_, P, R>,
    spec: InstanceSpec<'_>,
    mut cancelled: watch::Receiver<bool>,
) -> InstanceReport
where
    P: CloudProvider,
    N: NetworkProbe,
    S: RemoteShell,
    R: ProgressReporter,
{
    let label = spec.label();
    let mut report = InstanceReport::new(spec.index);

    ctx.reporter
        .step(&format!("{label} launching {} spot instance", spec.plan.instance_type));
    let mut handle = match provisioner::launch(ctx.provider, &spec).await {
        Ok(handle) => handle,
        Err(e) => {
            report.fail(&e, ctx.reporter);
            if let Some(ProvisioningError::NoAddress {
                instance_id: Some(id),
            }) = e.downcast_ref::<ProvisioningError>()
            {
                teardown.register(id);
                report.advance(InstanceStage::Terminating);
                teardown.terminate(id).await;
            }
            report.advance(InstanceStage::Done);
            return report;
        }
    };
    teardown.register(&handle.instance_id);

    let workload = async {
        provisioner::record_spot_price(ctx.provider, &mut handle, ctx.reporter).await;
        ctx.reporter.success(&format!(
            "{label} instance {} starting with IP {} (image {}, spot price {}, type {})",
            handle.instance_id,
            handle.private_ip,
            spec.plan.identifiers.image_id,
            handle.spot_price.as_deref().unwrap_or("unknown"),
            spec.plan.instance_type,
        ));

        report.advance(InstanceStage::AwaitingReady);
        let ready = readiness::wait_until_ready(
            ctx.probe,
            &handle.private_ip,
            ctx.ssh_port,
            ctx.probe_policy,
            ctx.reporter,
            &label,
        )
        .await;

        match ready {
            Ok(_) => {
                report.advance(InstanceStage::Executing);
                if let Err(e) =
                    executor::execute(ctx.shell, &mut handle, &spec.plan.workload, ctx.reporter)
                        .await
                {
                    report.fail(&e, ctx.reporter);
                }
            }
            Err(e) => report.fail(&e, ctx.reporter),
        }
    };
    if unless_cancelled(&mut cancelled, workload).await.is_none() {
        report.interrupt();
    }

    report.advance(InstanceStage::Terminating);
    teardown.terminate(&handle.instance_id).await;
    report.advance(InstanceStage::Done);
    report.handle = Some(handle);
    report
}
