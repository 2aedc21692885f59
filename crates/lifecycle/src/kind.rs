//! Per-kind capabilities the controller is generic over.

use std::fmt::Debug;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::rbac::v1::Role;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kform_core::schema::Field;
use kform_core::{Progress, Result, Tree};
use kform_migrate::Migrator;
use kform_patch::{MutablePath, PatchOperations};
use kform_translate::{deployment, role};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Cascading policy for the final delete call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Dependents are removed before the owner is considered gone.
    Foreground,
    Background,
}

pub trait ResourceKind: Send + Sync + 'static {
    type Object: k8s_openapi::Metadata<Ty = ObjectMeta>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    const KIND: &'static str;
    const PROPAGATION: Propagation;

    fn schema() -> &'static [Field];
    fn migrator() -> Migrator;
    fn mutable_paths() -> &'static [MutablePath];
    fn expand(tree: &Tree) -> Result<Self::Object>;
    fn flatten(obj: &Self::Object, prior: &Tree) -> Tree;

    /// Convergence predicate input. `None` means the kind converges as soon
    /// as the object can be read.
    fn progress(_obj: &Self::Object) -> Option<Progress> {
        None
    }

    /// Patch applied and waited on before deletion, if any.
    fn drain_patch() -> Result<Option<PatchOperations>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeploymentKind;

impl ResourceKind for DeploymentKind {
    type Object = Deployment;

    const KIND: &'static str = deployment::KIND;
    const PROPAGATION: Propagation = Propagation::Foreground;

    fn schema() -> &'static [Field] {
        deployment::FIELDS
    }

    fn migrator() -> Migrator {
        deployment::MIGRATOR
    }

    fn mutable_paths() -> &'static [MutablePath] {
        deployment::MUTABLE_PATHS
    }

    fn expand(tree: &Tree) -> Result<Deployment> {
        deployment::expand(tree)
    }

    fn flatten(obj: &Deployment, prior: &Tree) -> Tree {
        deployment::flatten(obj, prior)
    }

    fn progress(obj: &Deployment) -> Option<Progress> {
        Some(deployment::progress(obj))
    }

    fn drain_patch() -> Result<Option<PatchOperations>> {
        deployment::drain_patch().map(Some)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RoleKind;

impl ResourceKind for RoleKind {
    type Object = Role;

    const KIND: &'static str = role::KIND;
    const PROPAGATION: Propagation = Propagation::Background;

    fn schema() -> &'static [Field] {
        role::FIELDS
    }

    fn migrator() -> Migrator {
        role::MIGRATOR
    }

    fn mutable_paths() -> &'static [MutablePath] {
        role::MUTABLE_PATHS
    }

    fn expand(tree: &Tree) -> Result<Role> {
        role::expand(tree)
    }

    fn flatten(obj: &Role, prior: &Tree) -> Tree {
        role::flatten(obj, prior)
    }
}
