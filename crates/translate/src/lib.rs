//! kform translate: bidirectional mapping between configuration trees and
//! the typed Kubernetes objects for each supported resource kind.
//!
//! `expand` turns a desired tree into a typed object, failing with
//! `InvalidShape` when a required block is missing. `flatten` maps an observed
//! object back into a tree, reconciling it against the prior configuration.

#![forbid(unsafe_code)]

pub mod deployment;
pub mod metadata;
pub mod pod;
pub mod role;

use kform_core::{Error, Result};
use serde_json::Value as Json;

pub(crate) fn root_fields(tree: &Json) -> Result<&kform_core::tree::Fields> {
    tree.as_object().ok_or_else(|| Error::invalid_shape("configuration must be an object"))
}

pub(crate) fn required_block<'a>(
    fields: &'a kform_core::tree::Fields,
    key: &str,
    path: &str,
) -> Result<&'a kform_core::tree::Fields> {
    kform_core::tree::block(fields, key).ok_or_else(|| Error::invalid_shape(format!("{} block is required", path)))
}

/// Narrow a tree integer into the API's 32-bit field.
pub(crate) fn int32(value: i64, path: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| Error::invalid_shape(format!("{}: {} is out of range", path, value)))
}

pub(crate) fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
    (!v.is_empty()).then_some(v)
}
