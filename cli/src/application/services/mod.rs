//! Application services: use-case orchestration.
//!
//! Each service module implements one component of a run by composing domain
//! logic with port trait calls. Services import only from `crate::domain` and
//! `crate::application::ports`, never from `crate::infra`, `crate::commands`,
//! or `crate::output`.

pub mod coordinator;
pub mod credentials;
pub mod executor;
pub mod planner;
pub mod provisioner;
pub mod readiness;
pub mod resolver;
