//! kform core types: errors, identity, desired-configuration trees and the
//! flat attribute records they are persisted as.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod error;
pub mod flatmap;
pub mod identity;
pub mod schema;
pub mod tree;

pub use error::{CallKind, Error, Result};
pub use flatmap::{Attributes, StateRecord};
pub use identity::Identity;

/// Desired-configuration tree. Always a JSON object at the top level; singular
/// nested blocks are one-element arrays of objects.
pub type Tree = serde_json::Value;

pub mod prelude {
    pub use super::{Attributes, CallKind, Error, Identity, Progress, Result, StateRecord, Tree};
}

/// Observed vs desired value for a convergence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub observed: i64,
    pub desired: i64,
}

impl Progress {
    pub fn new(observed: i64, desired: i64) -> Self {
        Self { observed, desired }
    }

    pub fn converged(&self) -> bool {
        self.observed == self.desired
    }
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} of {}", self.observed, self.desired)
    }
}
