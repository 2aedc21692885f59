//! kform lifecycle: the create/read/update/delete/exists entry points for
//! one resource at a time, generic over the resource kind and the control API.

#![forbid(unsafe_code)]

pub mod config;
pub mod control;
pub mod controller;
pub mod kind;
pub mod mock;

pub use config::ControllerConfig;
pub use control::{ControlApi, KubeControl};
pub use controller::{load, migrate_record, plan, store, Controller, Existence, ResourceData};
pub use kind::{DeploymentKind, Propagation, ResourceKind, RoleKind};
pub use mock::{Call, MockControl};
