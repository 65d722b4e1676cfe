//! CLI argument parsing with clap derive

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands;
use crate::output::OutputContext;

/// Run ad-hoc workloads on ephemeral EC2 spot instances
#[derive(Parser)]
#[command(
    name = "ec2-runner",
    version,
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a workload on ephemeral spot instances and destroy them afterwards
    Run(commands::run::RunArgs),

    /// Show version
    Version,
}

impl Cli {
    /// Execute the CLI command and return the process exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails before any instance work starts.
    pub async fn run(self) -> Result<i32> {
        let Cli {
            quiet,
            no_color,
            command,
        } = self;
        match command {
            Command::Version => {
                commands::version::run();
                Ok(0)
            }
            Command::Run(args) => {
                let ctx = OutputContext::new(no_color, quiet);
                commands::run::run(&args, &ctx).await
            }
        }
    }
}
