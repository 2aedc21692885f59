//! Flat string-keyed records mirroring configuration trees.
//!
//! Keys are dotted paths (`spec.0.replicas`). Lists and blocks carry a
//! `<key>.#` length counter, maps a `<key>.%` size counter. All values are
//! strings; the schema restores their types on the way back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::schema::{Field, FieldType};
use crate::tree::Fields;
use crate::{Error, Result};

pub type Attributes = BTreeMap<String, String>;

/// Persisted observed state of one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// `<namespace>/<name>`, empty when the resource is not created.
    pub id: String,
    pub schema_version: u32,
    pub attributes: Attributes,
}

impl StateRecord {
    /// A record without attributes is the "never created" sentinel.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// Encode a tree into flat attributes using `schema`. Fields unknown to the
/// schema are not persisted.
pub fn to_attributes(tree: &Json, schema: &'static [Field]) -> Attributes {
    let mut out = Attributes::new();
    if let Some(fields) = tree.as_object() {
        write_block(&mut out, "", fields, schema);
    }
    out
}

/// Decode flat attributes back into a tree.
pub fn from_attributes(attrs: &Attributes, schema: &'static [Field]) -> Result<Json> {
    read_block(attrs, "", schema).map(Json::Object)
}

fn write_block(out: &mut Attributes, prefix: &str, fields: &Fields, schema: &'static [Field]) {
    for f in schema {
        let Some(v) = fields.get(f.name) else { continue };
        let key = format!("{}{}", prefix, f.name);
        match f.ty {
            FieldType::String => {
                if let Some(s) = v.as_str() {
                    out.insert(key, s.to_string());
                }
            }
            FieldType::Int => {
                if let Some(i) = v.as_i64() {
                    out.insert(key, i.to_string());
                }
            }
            FieldType::Bool => {
                if let Some(b) = v.as_bool() {
                    out.insert(key, b.to_string());
                }
            }
            FieldType::StringList => {
                let items: Vec<&str> = v.as_array().into_iter().flatten().filter_map(|i| i.as_str()).collect();
                out.insert(format!("{}.#", key), items.len().to_string());
                for (i, s) in items.into_iter().enumerate() {
                    out.insert(format!("{}.{}", key, i), s.to_string());
                }
            }
            FieldType::StringMap => {
                let Some(obj) = v.as_object() else { continue };
                out.insert(format!("{}.%", key), obj.len().to_string());
                for (k, mv) in obj {
                    if let Some(s) = mv.as_str() {
                        out.insert(format!("{}.{}", key, k), s.to_string());
                    }
                }
            }
            FieldType::Block { fields: inner, .. } => {
                let elems: Vec<&Fields> = v.as_array().into_iter().flatten().filter_map(|i| i.as_object()).collect();
                out.insert(format!("{}.#", key), elems.len().to_string());
                for (i, elem) in elems.into_iter().enumerate() {
                    write_block(out, &format!("{}.{}.", key, i), elem, inner);
                }
            }
        }
    }
}

fn read_block(attrs: &Attributes, prefix: &str, schema: &'static [Field]) -> Result<Fields> {
    let mut out = Fields::new();
    for f in schema {
        let key = format!("{}{}", prefix, f.name);
        let value = match f.ty {
            FieldType::String => attrs.get(&key).map(|s| Json::String(s.clone())),
            FieldType::Int => match attrs.get(&key) {
                Some(s) => Some(Json::from(
                    s.parse::<i64>().map_err(|_| Error::invalid_shape(format!("{}: expected integer, got {:?}", key, s)))?,
                )),
                None => None,
            },
            FieldType::Bool => match attrs.get(&key).map(|s| s.as_str()) {
                Some("true") => Some(Json::Bool(true)),
                Some("false") => Some(Json::Bool(false)),
                Some(other) => return Err(Error::invalid_shape(format!("{}: expected boolean, got {:?}", key, other))),
                None => None,
            },
            FieldType::StringList => match list_len(attrs, &key)? {
                Some(n) => Some(Json::Array(
                    (0..n)
                        .filter_map(|i| attrs.get(&format!("{}.{}", key, i)))
                        .map(|s| Json::String(s.clone()))
                        .collect(),
                )),
                None => None,
            },
            FieldType::StringMap => {
                let entry_prefix = format!("{}.", key);
                let obj: Fields = attrs
                    .iter()
                    .filter_map(|(k, v)| k.strip_prefix(&entry_prefix).map(|rest| (rest, v)))
                    .filter(|(rest, _)| *rest != "%")
                    .map(|(rest, v)| (rest.to_string(), Json::String(v.clone())))
                    .collect();
                if obj.is_empty() && !attrs.contains_key(&format!("{}.%", key)) {
                    None
                } else {
                    Some(Json::Object(obj))
                }
            }
            FieldType::Block { fields: inner, .. } => match list_len(attrs, &key)? {
                Some(n) => {
                    let mut elems = Vec::with_capacity(n);
                    for i in 0..n {
                        elems.push(Json::Object(read_block(attrs, &format!("{}.{}.", key, i), inner)?));
                    }
                    Some(Json::Array(elems))
                }
                None => None,
            },
        };
        if let Some(v) = value {
            out.insert(f.name.to_string(), v);
        }
    }
    Ok(out)
}

/// Length of a list or block: the `.#` counter when present, otherwise one
/// past the highest index found under `key`.
fn list_len(attrs: &Attributes, key: &str) -> Result<Option<usize>> {
    let counter = format!("{}.#", key);
    if let Some(s) = attrs.get(&counter) {
        return s
            .parse::<usize>()
            .map(Some)
            .map_err(|_| Error::invalid_shape(format!("{}: expected count, got {:?}", counter, s)));
    }
    let entry_prefix = format!("{}.", key);
    let max = attrs
        .keys()
        .filter_map(|k| k.strip_prefix(&entry_prefix))
        .filter_map(|rest| rest.split('.').next()?.parse::<usize>().ok())
        .max();
    Ok(max.map(|m| m + 1))
}
