//! Lifecycle coordination: fan-out, teardown, interrupt, exit codes.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::atomic::Ordering;
use std::time::Duration;

use ec2_runner::application::services::coordinator::{
    RunContext, RunOutcome, Teardown, run_all,
};
use ec2_runner::application::services::planner::{PlanRequest, prepare};
use ec2_runner::application::services::resolver::{ResolutionRequest, ResourceQuery};
use ec2_runner::domain::InstanceStage;

use crate::helpers::{ephemeral_key, fast_probe, image, operator_key, plan, strings};
use crate::mocks::{
    FakeProvider, LaunchBehaviour, NoopReporter, RecordingReporter, RecordingShell,
    ScriptedProbe, SessionBehaviour,
};

fn context<'a>(
    provider: &'a FakeProvider,
    probe: &'a ScriptedProbe,
    shell: &'a RecordingShell,
    reporter: &'a RecordingReporter,
) -> RunContext<'a, FakeProvider, ScriptedProbe, RecordingShell, RecordingReporter> {
    RunContext {
        provider,
        probe,
        shell,
        reporter,
        ssh_port: 22,
        probe_policy: fast_probe(),
    }
}

/// Resolves once `shell` has started `sessions` remote sessions.
async fn after_sessions(shell: &RecordingShell, sessions: usize) {
    while shell.started() < sessions {
        tokio::task::yield_now().await;
    }
}

fn never() -> std::future::Pending<()> {
    std::future::pending()
}

#[tokio::test]
async fn test_single_instance_end_to_end_exit_zero() {
    let provider = FakeProvider::default();
    let probe = ScriptedProbe::accepting();
    let shell = RecordingShell::new(SessionBehaviour::Exit(0));
    let reporter = RecordingReporter::default();
    let plan = plan("echo hi");
    let key = ephemeral_key();

    let outcome = run_all(
        &context(&provider, &probe, &shell, &reporter),
        &plan,
        &key,
        1,
        never(),
    )
    .await;

    assert_eq!(outcome.exit_code(), 0);
    let RunOutcome::Completed { reports, .. } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].stage, InstanceStage::Done);
    assert_eq!(reports[0].completion(), Some(0));
    assert!(reports[0].failure.is_none());
    assert_eq!(provider.launch_requests().len(), 1);
    assert_eq!(shell.sessions()[0].command, "echo hi");
    assert_eq!(provider.terminated(), vec!["i-1"]);
    assert_eq!(provider.deleted_keys(), vec!["ec2-runner-abcdefghij"]);
}

#[tokio::test]
async fn test_launch_summary_is_reported() {
    let provider = FakeProvider::default();
    let probe = ScriptedProbe::accepting();
    let shell = RecordingShell::new(SessionBehaviour::Exit(0));
    let reporter = RecordingReporter::default();

    run_all(
        &context(&provider, &probe, &shell, &reporter),
        &plan("true"),
        &ephemeral_key(),
        1,
        never(),
    )
    .await;

    let messages = reporter.messages();
    assert!(messages.iter().any(|m| m.contains("instance i-1 starting with IP 10.0.0.1")
        && m.contains("ami-0abc")
        && m.contains("0.0035")
        && m.contains("t2.micro")));
    assert!(messages.iter().any(|m| m.contains("instance i-1 shutting-down")));
}

#[tokio::test]
async fn test_remote_exit_code_becomes_process_exit_code() {
    let provider = FakeProvider::default();
    let probe = ScriptedProbe::accepting();
    let shell = RecordingShell::new(SessionBehaviour::Exit(3));
    let reporter = RecordingReporter::default();

    let outcome = run_all(
        &context(&provider, &probe, &shell, &reporter),
        &plan("exit 3"),
        &ephemeral_key(),
        1,
        never(),
    )
    .await;

    assert_eq!(outcome.exit_code(), 3);
    assert_eq!(provider.terminated(), vec!["i-1"]);
}

#[tokio::test]
async fn test_three_instances_share_identifiers_and_run_independently() {
    let provider = FakeProvider::default();
    let probe = ScriptedProbe::accepting();
    let shell = RecordingShell::new(SessionBehaviour::Exit(0));
    let reporter = RecordingReporter::default();

    let outcome = run_all(
        &context(&provider, &probe, &shell, &reporter),
        &plan("hostname"),
        &ephemeral_key(),
        3,
        never(),
    )
    .await;

    let RunOutcome::Completed { reports, exit_code } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(exit_code, 0);
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| r.completion() == Some(0)));

    let requests = provider.launch_requests();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|r| r == &requests[0]));

    assert_eq!(provider.terminated(), vec!["i-1", "i-2", "i-3"]);
    assert_eq!(provider.deleted_keys().len(), 1, "key destroyed exactly once");

    let labelled = shell
        .sessions()
        .iter()
        .filter(|s| s.label.is_some())
        .count();
    assert_eq!(labelled, 2, "every instance but the first is labelled");
}

#[tokio::test]
async fn test_interrupt_terminates_every_instance_and_exits_130() {
    let provider = FakeProvider::default();
    let probe = ScriptedProbe::accepting();
    let shell = RecordingShell::new(SessionBehaviour::Hang);
    let reporter = RecordingReporter::default();
    let plan = plan("sleep 3600");
    let key = ephemeral_key();

    let outcome = run_all(
        &context(&provider, &probe, &shell, &reporter),
        &plan,
        &key,
        3,
        after_sessions(&shell, 3),
    )
    .await;

    assert_eq!(outcome.exit_code(), 130);
    let RunOutcome::Interrupted { mut terminated } = outcome else {
        panic!("expected interrupt");
    };
    terminated.sort();
    assert_eq!(terminated, vec!["i-1", "i-2", "i-3"]);
    assert_eq!(provider.terminated(), vec!["i-1", "i-2", "i-3"]);
    assert_eq!(provider.deleted_keys().len(), 1);
}

#[tokio::test]
async fn test_interrupt_during_launch_terminates_instances_that_come_up() {
    let provider = FakeProvider {
        launch_delay: Some(Duration::from_millis(50)),
        ..FakeProvider::default()
    };
    let probe = ScriptedProbe::accepting();
    let shell = RecordingShell::new(SessionBehaviour::Exit(0));
    let reporter = RecordingReporter::default();

    let outcome = run_all(
        &context(&provider, &probe, &shell, &reporter),
        &plan("sleep 3600"),
        &ephemeral_key(),
        3,
        tokio::task::yield_now(),
    )
    .await;

    assert_eq!(outcome.exit_code(), 130);
    let RunOutcome::Interrupted { terminated } = outcome else {
        panic!("expected interrupt");
    };
    assert_eq!(provider.launches.load(Ordering::SeqCst), 3);
    assert_eq!(terminated, vec!["i-1", "i-2", "i-3"]);
    assert_eq!(provider.terminated(), vec!["i-1", "i-2", "i-3"]);
    assert_eq!(probe.attempts(), 0);
    assert_eq!(shell.started(), 0);
    assert_eq!(provider.deleted_keys().len(), 1);
}

#[tokio::test]
async fn test_interrupt_after_resolving_by_name_and_filter() {
    let provider = FakeProvider {
        images: vec![image("ami-0named", "2024-05-01T00:00:00.000Z")],
        subnets: strings(&["subnet-1"]),
        ..FakeProvider::default()
    };
    let request = PlanRequest {
        resolution: ResolutionRequest {
            image: ResourceQuery {
                name: Some("ubuntu-*".to_string()),
                filters: strings(&["architecture=x86_64"]),
                ..ResourceQuery::default()
            },
            subnet: ResourceQuery {
                filters: strings(&["vpc-id=vpc-1"]),
                ..ResourceQuery::default()
            },
            ..ResolutionRequest::default()
        },
        instance_type: "t2.micro".to_string(),
        block_duration_minutes: Some(60),
        wait_for_boot: true,
        command: Some("sleep 3600".to_string()),
        ..PlanRequest::default()
    };
    let key = ephemeral_key();
    let mut plan = prepare(&provider, &request).await.unwrap();
    plan.key_name = key.name.clone();

    let probe = ScriptedProbe::accepting();
    let shell = RecordingShell::new(SessionBehaviour::Hang);
    let reporter = RecordingReporter::default();

    let outcome = run_all(
        &context(&provider, &probe, &shell, &reporter),
        &plan,
        &key,
        3,
        after_sessions(&shell, 3),
    )
    .await;

    assert_eq!(outcome.exit_code(), 130);
    let requests = provider.launch_requests();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|r| r == &requests[0]));
    assert_eq!(requests[0].image_id, "ami-0named");
    assert_eq!(requests[0].subnet_id, "subnet-1");
    assert_eq!(requests[0].key_name, "ec2-runner-abcdefghij");
    assert_eq!(provider.image_filters.lock().unwrap().len(), 1);
    assert_eq!(provider.terminated(), vec!["i-1", "i-2", "i-3"]);
    assert_eq!(provider.deleted_keys().len(), 1);
}

#[tokio::test]
async fn test_interrupt_with_keep_alive_leaves_instances_running() {
    let provider = FakeProvider::default();
    let probe = ScriptedProbe::accepting();
    let shell = RecordingShell::new(SessionBehaviour::Hang);
    let reporter = RecordingReporter::default();
    let mut plan = plan("sleep 3600");
    plan.keep_alive = true;

    let outcome = run_all(
        &context(&provider, &probe, &shell, &reporter),
        &plan,
        &ephemeral_key(),
        2,
        after_sessions(&shell, 2),
    )
    .await;

    assert_eq!(outcome.exit_code(), 130);
    assert!(provider.terminated().is_empty());
    assert_eq!(provider.deleted_keys().len(), 1);
}

#[tokio::test]
async fn test_keep_alive_skips_termination_on_completion() {
    let provider = FakeProvider::default();
    let probe = ScriptedProbe::accepting();
    let shell = RecordingShell::new(SessionBehaviour::Exit(0));
    let reporter = RecordingReporter::default();
    let mut plan = plan("true");
    plan.keep_alive = true;

    let outcome = run_all(
        &context(&provider, &probe, &shell, &reporter),
        &plan,
        &ephemeral_key(),
        1,
        never(),
    )
    .await;

    assert_eq!(outcome.exit_code(), 0);
    assert!(provider.terminated().is_empty());
}

#[tokio::test]
async fn test_operator_key_is_never_destroyed() {
    let provider = FakeProvider::default();
    let probe = ScriptedProbe::accepting();
    let shell = RecordingShell::new(SessionBehaviour::Exit(0));
    let reporter = RecordingReporter::default();

    run_all(
        &context(&provider, &probe, &shell, &reporter),
        &plan("true"),
        &operator_key(),
        2,
        never(),
    )
    .await;

    assert!(provider.deleted_keys().is_empty());
}

#[tokio::test]
async fn test_unreachable_instance_is_terminated_and_siblings_unaffected() {
    let provider = FakeProvider::default();
    let probe = ScriptedProbe::refusing();
    let shell = RecordingShell::new(SessionBehaviour::Exit(0));
    let reporter = RecordingReporter::default();

    let outcome = run_all(
        &context(&provider, &probe, &shell, &reporter),
        &plan("true"),
        &ephemeral_key(),
        2,
        never(),
    )
    .await;

    let RunOutcome::Completed { reports, exit_code } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(exit_code, 1, "a failed instance counts as exit code 1");
    for report in &reports {
        let failure = report.failure.as_ref().expect("probe failure recorded");
        assert_eq!(failure.stage, InstanceStage::AwaitingReady);
        assert_eq!(report.stage, InstanceStage::Done);
    }
    assert_eq!(shell.started(), 0);
    assert_eq!(provider.terminated(), vec!["i-1", "i-2"]);
}

#[tokio::test]
async fn test_transport_failure_still_terminates() {
    let provider = FakeProvider::default();
    let probe = ScriptedProbe::accepting();
    let shell = RecordingShell::new(SessionBehaviour::TransportFailure);
    let reporter = RecordingReporter::default();

    let outcome = run_all(
        &context(&provider, &probe, &shell, &reporter),
        &plan("true"),
        &ephemeral_key(),
        1,
        never(),
    )
    .await;

    let RunOutcome::Completed { reports, exit_code } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(exit_code, 1);
    assert_eq!(
        reports[0].failure.as_ref().map(|f| f.stage),
        Some(InstanceStage::Executing)
    );
    assert_eq!(provider.terminated(), vec!["i-1"]);
}

#[tokio::test]
async fn test_launch_without_address_terminates_the_reported_instance() {
    let provider = FakeProvider {
        launch: LaunchBehaviour::NoAddress,
        ..FakeProvider::default()
    };
    let probe = ScriptedProbe::accepting();
    let shell = RecordingShell::new(SessionBehaviour::Exit(0));
    let reporter = RecordingReporter::default();

    let outcome = run_all(
        &context(&provider, &probe, &shell, &reporter),
        &plan("true"),
        &ephemeral_key(),
        1,
        never(),
    )
    .await;

    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(probe.attempts(), 0);
    assert_eq!(provider.terminated(), vec!["i-1"]);
}

#[tokio::test]
async fn test_rejected_launch_has_nothing_to_terminate() {
    let provider = FakeProvider {
        launch: LaunchBehaviour::Reject,
        ..FakeProvider::default()
    };
    let probe = ScriptedProbe::accepting();
    let shell = RecordingShell::new(SessionBehaviour::Exit(0));
    let reporter = RecordingReporter::default();

    let outcome = run_all(
        &context(&provider, &probe, &shell, &reporter),
        &plan("true"),
        &ephemeral_key(),
        1,
        never(),
    )
    .await;

    assert_eq!(outcome.exit_code(), 1);
    assert!(provider.terminated().is_empty());
    assert_eq!(provider.deleted_keys().len(), 1);
}

#[tokio::test]
async fn test_termination_failure_is_reported_not_fatal() {
    let provider = FakeProvider {
        fail_terminate: true,
        ..FakeProvider::default()
    };
    let probe = ScriptedProbe::accepting();
    let shell = RecordingShell::new(SessionBehaviour::Exit(0));
    let reporter = RecordingReporter::default();

    let outcome = run_all(
        &context(&provider, &probe, &shell, &reporter),
        &plan("true"),
        &ephemeral_key(),
        1,
        never(),
    )
    .await;

    assert_eq!(outcome.exit_code(), 0);
    assert!(
        reporter
            .messages()
            .iter()
            .any(|m| m.starts_with("error: unable to terminate instance i-1"))
    );
}

// ── Teardown primitives ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_terminate_is_idempotent_per_instance() {
    let provider = FakeProvider::default();
    let key = ephemeral_key();
    let teardown = Teardown::new(&provider, &NoopReporter, &key, false);
    teardown.register("i-1");

    assert!(teardown.terminate("i-1").await);
    assert!(!teardown.terminate("i-1").await);
    assert!(teardown.terminate_all().await.is_empty());

    assert_eq!(provider.terminated(), vec!["i-1"]);
}

#[tokio::test]
async fn test_abandoned_termination_is_reissued_by_sweep() {
    let provider = FakeProvider {
        stall_first_terminate: true,
        ..FakeProvider::default()
    };
    let key = ephemeral_key();
    let teardown = Teardown::new(&provider, &NoopReporter, &key, false);
    teardown.register("i-1");

    tokio::select! {
        _ = teardown.terminate("i-1") => panic!("first termination should stall"),
        () = tokio::task::yield_now() => {}
    }
    assert!(teardown.settled().is_empty());

    assert_eq!(teardown.terminate_all().await, vec!["i-1"]);
    assert_eq!(provider.terminate_calls.load(Ordering::SeqCst), 2);
    assert_eq!(provider.terminated(), vec!["i-1"]);
    assert_eq!(teardown.settled(), vec!["i-1"]);
}

#[tokio::test]
async fn test_key_destroyed_at_most_once_across_paths() {
    let provider = FakeProvider::default();
    let key = ephemeral_key();
    let teardown = Teardown::new(&provider, &NoopReporter, &key, false);

    tokio::join!(teardown.destroy_key(), teardown.destroy_key());
    teardown.destroy_key().await;

    assert_eq!(provider.deleted_keys().len(), 1);
}
