//! Version command

/// Run the version command.
pub fn run() {
    println!("ec2-runner {}", env!("CARGO_PKG_VERSION"));
}
