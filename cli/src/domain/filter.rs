//! `KEY=VALUE` parsing for resource filters, tags and environment variables.
//!
//! Pure functions only, without I/O.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;

use crate::domain::error::ResolutionError;

/// A provider-native filter predicate: one name, one or more accepted values.
///
/// Serializes to the shape the EC2 API expects (`{"Name": .., "Values": [..]}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    /// A filter on a single exact value.
    #[must_use]
    pub fn single(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            values: vec![value.to_string()],
        }
    }
}

/// Splits `entry` at the first `=` into a non-empty key and a value.
///
/// # Errors
///
/// Returns `ResolutionError::MalformedPair` if `entry` has no `=` or the key
/// is empty.
pub fn split_pair<'a>(kind: &'static str, entry: &'a str) -> Result<(&'a str, &'a str)> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => Err(ResolutionError::MalformedPair {
            kind,
            entry: entry.to_string(),
        }
        .into()),
    }
}

/// Parses operator filters, preserving their order.
///
/// The value part is a comma-separated list: `state=available,pending`
/// yields one filter with two values.
///
/// # Errors
///
/// Returns an error on the first entry that is not `KEY=VALUE`.
pub fn parse_filters(entries: &[String]) -> Result<Vec<Filter>> {
    entries
        .iter()
        .map(|entry| {
            let (name, value) = split_pair("filter", entry)?;
            Ok(Filter {
                name: name.to_string(),
                values: value.split(',').map(str::to_string).collect(),
            })
        })
        .collect()
}

/// Parses `KEY=VALUE` tags. A repeated key keeps its last value.
///
/// # Errors
///
/// Returns an error on the first entry that is not `KEY=VALUE`.
pub fn parse_tags(entries: &[String]) -> Result<BTreeMap<String, String>> {
    let mut tags = BTreeMap::new();
    for entry in entries {
        let (key, value) = split_pair("tag", entry)?;
        tags.insert(key.to_string(), value.to_string());
    }
    Ok(tags)
}

/// Parses `KEY=VALUE` environment variables for the remote command.
///
/// # Errors
///
/// Returns an error if an entry is not `KEY=VALUE` or the key is not a valid
/// shell identifier.
pub fn parse_env_vars(entries: &[String]) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    for entry in entries {
        let (key, value) = split_pair("environment", entry)?;
        if !is_shell_identifier(key) {
            return Err(ResolutionError::InvalidEnvName(key.to_string()).into());
        }
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

fn is_shell_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
