//! ec2-runner - run ad-hoc workloads on ephemeral EC2 spot instances

#![cfg_attr(test, allow(clippy::expect_used))]

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ec2_runner::cli::Cli;

/// Environment variable holding the tracing filter directives.
const LOG_ENV: &str = "EC2_RUNNER_LOG";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    // Exit from inside the runtime: a pending stdin relay would otherwise
    // keep runtime shutdown waiting on its blocking read.
    match cli.run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}
