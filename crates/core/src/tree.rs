//! Accessors and builders for desired-configuration trees.
//!
//! A tree is a JSON object of named fields. Nested blocks are arrays of
//! objects (singular blocks hold at most one element), maps are objects of
//! strings, and scalars are strings, integers or booleans. Builders omit empty
//! maps and lists so that trees stay in canonical form.

use std::collections::BTreeMap;

use serde_json::{Map, Value as Json};

/// Fields of one block.
pub type Fields = Map<String, Json>;

/// Resolve a dotted path such as `spec.0.template.0.metadata`.
pub fn lookup<'a>(tree: &'a Json, path: &str) -> Option<&'a Json> {
    let mut cur = tree;
    for seg in path.split('.') {
        cur = match cur {
            Json::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            Json::Object(obj) => obj.get(seg)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// First element of a singular block, if present.
pub fn block<'a>(fields: &'a Fields, key: &str) -> Option<&'a Fields> {
    fields.get(key)?.as_array()?.first()?.as_object()
}

/// Top-level singular block of a whole tree.
pub fn root_block<'a>(tree: &'a Json, key: &str) -> Option<&'a Fields> {
    block(tree.as_object()?, key)
}

/// All elements of a repeated block.
pub fn blocks<'a>(fields: &'a Fields, key: &str) -> impl Iterator<Item = &'a Fields> + 'a {
    fields
        .get(key)
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_object())
}

/// Non-empty string field.
pub fn str_field<'a>(fields: &'a Fields, key: &str) -> Option<&'a str> {
    fields.get(key)?.as_str().filter(|s| !s.is_empty())
}

pub fn int_field(fields: &Fields, key: &str) -> Option<i64> {
    fields.get(key)?.as_i64()
}

pub fn bool_field(fields: &Fields, key: &str) -> Option<bool> {
    fields.get(key)?.as_bool()
}

pub fn string_map(fields: &Fields, key: &str) -> BTreeMap<String, String> {
    match fields.get(key).and_then(|v| v.as_object()) {
        Some(obj) => obj
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
        None => BTreeMap::new(),
    }
}

pub fn string_list(fields: &Fields, key: &str) -> Vec<String> {
    match fields.get(key).and_then(|v| v.as_array()) {
        Some(items) => items.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect(),
        None => Vec::new(),
    }
}

/// Wrap a block's fields as a singular block value.
pub fn singular(fields: Fields) -> Json {
    Json::Array(vec![Json::Object(fields)])
}

pub fn put_str(fields: &mut Fields, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        fields.insert(key.to_string(), Json::String(v.to_string()));
    }
}

pub fn put_int(fields: &mut Fields, key: &str, value: Option<i64>) {
    if let Some(v) = value {
        fields.insert(key.to_string(), Json::from(v));
    }
}

pub fn put_bool(fields: &mut Fields, key: &str, value: Option<bool>) {
    if let Some(v) = value {
        fields.insert(key.to_string(), Json::Bool(v));
    }
}

pub fn put_map(fields: &mut Fields, key: &str, value: &BTreeMap<String, String>) {
    if value.is_empty() {
        return;
    }
    let obj: Fields = value.iter().map(|(k, v)| (k.clone(), Json::String(v.clone()))).collect();
    fields.insert(key.to_string(), Json::Object(obj));
}

pub fn put_list(fields: &mut Fields, key: &str, value: &[String]) {
    if value.is_empty() {
        return;
    }
    fields.insert(key.to_string(), Json::Array(value.iter().cloned().map(Json::String).collect()));
}

pub fn put_blocks(fields: &mut Fields, key: &str, value: Vec<Fields>) {
    if value.is_empty() {
        return;
    }
    fields.insert(key.to_string(), Json::Array(value.into_iter().map(Json::Object).collect()));
}
