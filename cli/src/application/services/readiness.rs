//! Readiness probe: wait until the remote-access port accepts connections.

use std::time::Duration;

use anyhow::Result;

use crate::application::ports::{NetworkProbe, ProgressReporter};
use crate::domain::ConnectivityTimeoutError;

/// Attempt budget and timings for the readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub attempts: u32,
    /// Pause after a failed attempt.
    pub backoff: Duration,
    /// Connect timeout of a single attempt.
    pub connect_timeout: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            backoff: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Poll `host:port` until a connection succeeds.
///
/// Returns the number of attempts used.
///
/// # Errors
///
/// Returns `ConnectivityTimeoutError` once every attempt has failed.
pub async fn wait_until_ready(
    probe: &impl NetworkProbe,
    host: &str,
    port: u16,
    policy: ProbePolicy,
    reporter: &impl ProgressReporter,
    label: &str,
) -> Result<u32> {
    for attempt in 1..=policy.attempts {
        reporter.step(&format!(
            "{label} waiting for SSH {host}:{port} (attempt {attempt}/{})",
            policy.attempts
        ));
        match probe.connect(host, port, policy.connect_timeout).await {
            Ok(()) => {
                reporter.success(&format!("{label} {host}:{port} is ready"));
                return Ok(attempt);
            }
            Err(e) => {
                tracing::debug!(%host, port, attempt, error = %e, "instance not yet reachable");
                if attempt < policy.attempts {
                    tokio::time::sleep(policy.backoff).await;
                }
            }
        }
    }

    Err(ConnectivityTimeoutError {
        host: host.to_string(),
        port,
        attempts: policy.attempts,
    }
    .into())
}
