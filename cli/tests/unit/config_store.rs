//! `YamlConfigStore` loading from the path named by `EC2_RUNNER_CONFIG`.
//!
//! These tests mutate a process-wide env var and are serialized.

#![allow(clippy::expect_used, clippy::unwrap_used, unsafe_code)]

use ec2_runner::application::ports::ConfigStore;
use ec2_runner::domain::RunnerConfig;
use ec2_runner::infra::config::{CONFIG_ENV, YamlConfigStore};
use serial_test::serial;
use tempfile::TempDir;

fn point_config_at(path: &std::path::Path) {
    // SAFETY: every test touching CONFIG_ENV is #[serial].
    unsafe { std::env::set_var(CONFIG_ENV, path) };
}

#[test]
#[serial]
fn test_missing_file_loads_defaults() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("absent.yaml");
    point_config_at(&path);

    let config = YamlConfigStore.load().unwrap();

    assert_eq!(config, RunnerConfig::default());
    assert_eq!(YamlConfigStore.path().unwrap(), path);
}

#[test]
#[serial]
fn test_file_values_are_loaded() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        "defaults:\n  user: ubuntu\n  ssh_port: 2222\n  block_duration_minutes: 0\naws:\n  region: eu-west-1\n",
    )
    .unwrap();
    point_config_at(&path);

    let config = YamlConfigStore.load().unwrap();

    assert_eq!(config.user(None), "ubuntu");
    assert_eq!(config.ssh_port(None), 2222);
    assert_eq!(config.block_duration(None), None);
    assert_eq!(config.instance_type(None), "t2.micro");
    assert_eq!(config.aws.region.as_deref(), Some("eu-west-1"));
    assert_eq!(config.aws.profile, None);
}

#[test]
#[serial]
fn test_flags_take_precedence_over_file() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "defaults:\n  user: ubuntu\n  instance_type: c5.large\n").unwrap();
    point_config_at(&path);

    let config = YamlConfigStore.load().unwrap();

    assert_eq!(config.user(Some("admin")), "admin");
    assert_eq!(config.instance_type(Some("t3.nano")), "t3.nano");
}

#[test]
#[serial]
fn test_malformed_file_is_an_error() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "defaults: [not, a, map]\n").unwrap();
    point_config_at(&path);

    let err = YamlConfigStore.load().unwrap_err();

    assert!(format!("{err:#}").contains("cannot parse"));
}
