//! Remote-access key pair provisioning.

use std::path::Path;

use anyhow::Result;
use rand::Rng;

use crate::application::ports::{CloudProvider, ProgressReporter};
use crate::domain::{KeyPair, ResolutionError, TeardownError};

/// Prefix of generated key pair names.
pub const EPHEMERAL_KEY_PREFIX: &str = "ec2-runner-";
/// Length of the random suffix of generated key pair names.
pub const EPHEMERAL_KEY_SUFFIX_LEN: usize = 10;

const SUFFIX_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Check that a key name and identity file are given together or not at all.
///
/// # Errors
///
/// Returns `ResolutionError` if exactly one of the two is set.
pub fn check_pairing(key_name: Option<&str>, identity_file: Option<&Path>) -> Result<()> {
    match (key_name, identity_file) {
        (Some(name), None) => Err(ResolutionError::MissingIdentityFile(name.to_string()).into()),
        (None, Some(path)) => {
            Err(ResolutionError::MissingKeyName(path.display().to_string()).into())
        }
        _ => Ok(()),
    }
}

/// Produce the key pair for this run.
///
/// With both `key_name` and `identity_file`, the identity file is read and
/// used verbatim. With neither, a new provider key pair with a random name
/// is created and marked ephemeral.
///
/// # Errors
///
/// Returns `ResolutionError` on an inconsistent pairing, an unreadable
/// identity file, or a failed key creation.
pub async fn provision_key_pair(
    provider: &impl CloudProvider,
    key_name: Option<&str>,
    identity_file: Option<&Path>,
) -> Result<KeyPair> {
    check_pairing(key_name, identity_file)?;

    if let (Some(name), Some(path)) = (key_name, identity_file) {
        let private_key = tokio::fs::read_to_string(path).await.map_err(|e| {
            ResolutionError::Unreadable {
                what: "identity file",
                path: path.display().to_string(),
                message: e.to_string(),
            }
        })?;
        return Ok(KeyPair {
            name: name.to_string(),
            private_key,
            ephemeral: false,
        });
    }

    let name = ephemeral_key_name();
    let private_key = provider.create_key_pair(&name).await.map_err(|e| {
        ResolutionError::Lookup {
            resource: "key pair",
            message: format!("unable to create key pair {name}: {e:#}"),
        }
    })?;
    tracing::info!(key_name = %name, "created ephemeral key pair");
    Ok(KeyPair {
        name,
        private_key,
        ephemeral: true,
    })
}

/// Delete an ephemeral key pair from the provider. Operator keys are left
/// alone. Failures are reported, never returned.
pub async fn destroy_key_pair(
    provider: &impl CloudProvider,
    key: &KeyPair,
    reporter: &impl ProgressReporter,
) {
    if !key.ephemeral {
        return;
    }
    match provider.delete_key_pair(&key.name).await {
        Ok(()) => reporter.success(&format!("destroyed key pair {}", key.name)),
        Err(e) => {
            let err = TeardownError::DeleteKeyPair {
                key_name: key.name.clone(),
                message: format!("{e:#}"),
            };
            tracing::warn!(error = %err, "key pair deletion failed");
            reporter.error(&err.to_string());
        }
    }
}

/// A random key pair name: prefix plus a fixed-length alphanumeric suffix.
#[must_use]
pub fn ephemeral_key_name() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..EPHEMERAL_KEY_SUFFIX_LEN)
        .map(|_| SUFFIX_CHARS[rng.random_range(0..SUFFIX_CHARS.len())] as char)
        .collect();
    format!("{EPHEMERAL_KEY_PREFIX}{suffix}")
}
