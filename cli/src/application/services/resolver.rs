//! Resource resolution: image, subnet and security groups.
//!
//! Runs once per invocation. Explicit ids are returned unchanged; names and
//! `KEY=VALUE` filters are turned into provider filters and looked up.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::application::ports::{CloudProvider, ImageRecord};
use crate::domain::filter::{Filter, parse_filters};
use crate::domain::{ResolutionError, ResolvedIdentifiers};

/// Provider filter matching an image by name (wildcards allowed).
const IMAGE_NAME_FILTER: &str = "name";
/// Provider filter matching a subnet by its `Name` tag.
const SUBNET_NAME_FILTER: &str = "tag:Name";
/// Provider filter matching security groups by name.
const GROUP_NAME_FILTER: &str = "group-name";

/// Operator input for one resource: explicit id, name, and raw filters.
#[derive(Debug, Clone, Default)]
pub struct ResourceQuery {
    pub id: Option<String>,
    pub name: Option<String>,
    pub filters: Vec<String>,
}

/// Operator input for security groups.
#[derive(Debug, Clone, Default)]
pub struct SecurityGroupQuery {
    pub ids: Vec<String>,
    pub names: Vec<String>,
    pub filters: Vec<String>,
}

/// All lookups performed before any instance is created.
#[derive(Debug, Clone, Default)]
pub struct ResolutionRequest {
    pub image: ResourceQuery,
    pub subnet: ResourceQuery,
    pub security_groups: SecurityGroupQuery,
}

/// Resolve image, subnet and security groups in that order.
///
/// # Errors
///
/// Returns the first `ResolutionError` encountered.
pub async fn resolve_all(
    provider: &impl CloudProvider,
    request: &ResolutionRequest,
) -> Result<ResolvedIdentifiers> {
    let image_id = resolve_image(provider, &request.image).await?;
    let subnet_id = resolve_subnet(provider, &request.subnet).await?;
    let security_group_ids = resolve_security_groups(provider, &request.security_groups).await?;
    tracing::info!(%image_id, %subnet_id, groups = ?security_group_ids, "resources resolved");
    Ok(ResolvedIdentifiers {
        image_id,
        subnet_id,
        security_group_ids,
    })
}

/// Resolve the image id; the most recently created match wins.
///
/// # Errors
///
/// Returns `ResolutionError` if no constraint is given, a filter is
/// malformed, the lookup fails, or nothing matches.
pub async fn resolve_image(provider: &impl CloudProvider, query: &ResourceQuery) -> Result<String> {
    if let Some(id) = &query.id {
        return Ok(id.clone());
    }
    if query.name.is_none() && query.filters.is_empty() {
        return Err(ResolutionError::UnconstrainedImage.into());
    }

    let filters = build_filters(IMAGE_NAME_FILTER, query.name.as_deref(), &query.filters)?;
    let images = provider
        .describe_images(&filters)
        .await
        .map_err(|e| lookup_error("image", &e))?;

    newest_image(images)
        .map(|image| image.image_id)
        .ok_or_else(|| ResolutionError::NoMatch("image").into())
}

/// Resolve the subnet id; the first match in provider order wins.
///
/// # Errors
///
/// Returns `ResolutionError` if a filter is malformed, the lookup fails, or
/// nothing matches.
pub async fn resolve_subnet(
    provider: &impl CloudProvider,
    query: &ResourceQuery,
) -> Result<String> {
    if let Some(id) = &query.id {
        return Ok(id.clone());
    }

    let filters = build_filters(SUBNET_NAME_FILTER, query.name.as_deref(), &query.filters)?;
    let subnets = provider
        .describe_subnets(&filters)
        .await
        .map_err(|e| lookup_error("subnet", &e))?;

    subnets
        .into_iter()
        .next()
        .ok_or_else(|| ResolutionError::NoMatch("subnets").into())
}

/// Resolve security groups: explicit ids first, then every lookup match.
///
/// With no names and no filters the explicit ids are returned as-is, which
/// may be an empty list.
///
/// # Errors
///
/// Returns `ResolutionError` if a filter is malformed, the lookup fails, or a
/// lookup matches nothing.
pub async fn resolve_security_groups(
    provider: &impl CloudProvider,
    query: &SecurityGroupQuery,
) -> Result<Vec<String>> {
    let mut ids = query.ids.clone();
    if query.names.is_empty() && query.filters.is_empty() {
        return Ok(ids);
    }

    let mut filters = parse_filters(&query.filters)?;
    if !query.names.is_empty() {
        filters.push(Filter {
            name: GROUP_NAME_FILTER.to_string(),
            values: query.names.clone(),
        });
    }

    let found = provider
        .describe_security_groups(&filters)
        .await
        .map_err(|e| lookup_error("security groups", &e))?;
    if found.is_empty() {
        return Err(ResolutionError::NoMatch("security groups").into());
    }

    for id in found {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

/// Pick the image with the latest creation timestamp.
///
/// Images whose timestamp cannot be parsed sort before every dated image.
#[must_use]
pub fn newest_image(mut images: Vec<ImageRecord>) -> Option<ImageRecord> {
    images.sort_by_key(|image| created_at(&image.creation_date));
    images.pop()
}

fn created_at(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn build_filters(name_key: &str, name: Option<&str>, raw: &[String]) -> Result<Vec<Filter>> {
    let mut filters = Vec::with_capacity(raw.len() + 1);
    if let Some(name) = name {
        filters.push(Filter::single(name_key, name));
    }
    filters.extend(parse_filters(raw)?);
    Ok(filters)
}

fn lookup_error(resource: &'static str, err: &anyhow::Error) -> anyhow::Error {
    ResolutionError::Lookup {
        resource,
        message: format!("{err:#}"),
    }
    .into()
}
