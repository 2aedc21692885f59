//! kform patch: compute minimal JSON-Patch operations between two
//! configuration trees, restricted to a kind's mutable paths.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kform_core::tree::lookup;
use kform_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

/// One JSON-Patch instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: Json },
    Replace { path: String, value: Json },
    Remove { path: String },
}

impl PatchOperation {
    pub fn replace(path: impl Into<String>, value: impl Serialize) -> Result<Self> {
        Ok(PatchOperation::Replace { path: path.into(), value: serde_json::to_value(value)? })
    }

    pub fn path(&self) -> &str {
        match self {
            PatchOperation::Add { path, .. } | PatchOperation::Replace { path, .. } | PatchOperation::Remove { path } => path,
        }
    }
}

/// Ordered operation sequence, serialized as a JSON array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchOperations(Vec<PatchOperation>);

impl PatchOperations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: PatchOperation) {
        self.0.push(op);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatchOperation> {
        self.0.iter()
    }

    /// Wire encoding submitted to the control API.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }
}

impl From<Vec<PatchOperation>> for PatchOperations {
    fn from(v: Vec<PatchOperation>) -> Self {
        Self(v)
    }
}

impl Extend<PatchOperation> for PatchOperations {
    fn extend<I: IntoIterator<Item = PatchOperation>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

/// A configuration path the patch builder is allowed to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutablePath {
    /// String map (labels, annotations) diffed key by key.
    StringMap { config: &'static str, wire: &'static str },
    /// Subtree replaced wholesale with its typed-object projection.
    Subtree { config: &'static str, wire: &'static str },
}

/// Escape a JSON pointer token (RFC 6901).
pub fn escape_json_pointer(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Per-key diff of two string maps under `prefix`.
pub fn diff_string_map(prefix: &str, old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> Vec<PatchOperation> {
    let prefix = prefix.trim_end_matches('/');
    if old.is_empty() {
        if new.is_empty() {
            return Vec::new();
        }
        let value = Json::Object(new.iter().map(|(k, v)| (k.clone(), Json::String(v.clone()))).collect());
        return vec![PatchOperation::Add { path: prefix.to_string(), value }];
    }
    let mut ops = Vec::new();
    for k in old.keys() {
        if !new.contains_key(k) {
            ops.push(PatchOperation::Remove { path: format!("{}/{}", prefix, escape_json_pointer(k)) });
        }
    }
    for (k, v) in new {
        let path = format!("{}/{}", prefix, escape_json_pointer(k));
        match old.get(k) {
            Some(prev) if prev == v => {}
            Some(_) => ops.push(PatchOperation::Replace { path, value: Json::String(v.clone()) }),
            None => ops.push(PatchOperation::Add { path, value: Json::String(v.clone()) }),
        }
    }
    ops
}

/// Whether `ops` adds a whole string map at one of `paths`. Such an add
/// replaces the live map, including keys the stored tree never held.
pub fn adds_whole_map(ops: &PatchOperations, paths: &[MutablePath]) -> bool {
    ops.iter().any(|op| match op {
        PatchOperation::Add { path, value } => value.is_object() && is_map_wire(paths, path),
        _ => false,
    })
}

/// Split whole-map adds into per-key adds wherever `live` already holds
/// the map.
pub fn rebase_map_adds(ops: PatchOperations, paths: &[MutablePath], live: &Json) -> PatchOperations {
    let mut out = PatchOperations::new();
    for op in ops.0 {
        match op {
            PatchOperation::Add { path, value: Json::Object(entries) }
                if is_map_wire(paths, &path) && live.pointer(&path).is_some_and(Json::is_object) =>
            {
                debug!(path = %path, keys = entries.len(), "live map present; adding per key");
                out.extend(
                    entries
                        .into_iter()
                        .map(|(k, value)| PatchOperation::Add { path: format!("{}/{}", path, escape_json_pointer(&k)), value }),
                );
            }
            other => out.push(other),
        }
    }
    out
}

fn is_map_wire(paths: &[MutablePath], path: &str) -> bool {
    paths.iter().any(|p| matches!(p, MutablePath::StringMap { wire, .. } if *wire == path))
}

fn string_map_at(tree: &Json, path: &str) -> BTreeMap<String, String> {
    lookup(tree, path)
        .and_then(|v| v.as_object())
        .map(|obj| obj.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

fn is_declared(v: Option<&Json>) -> bool {
    match v {
        None | Some(Json::Null) => false,
        Some(Json::Array(a)) => !a.is_empty(),
        Some(Json::Object(o)) => !o.is_empty(),
        Some(_) => true,
    }
}

/// Diff `old` against `new` over `paths`. `project` yields the typed-object
/// projection of `new` and is only evaluated when a subtree changed.
pub fn build_patch<F>(old: &Json, new: &Json, paths: &[MutablePath], project: F) -> Result<PatchOperations>
where
    F: FnOnce() -> Result<Json>,
{
    let mut project = Some(project);
    let mut projected: Option<Json> = None;
    let mut ops = PatchOperations::new();
    for p in paths {
        match *p {
            MutablePath::StringMap { config, wire } => {
                let before = string_map_at(old, config);
                let after = string_map_at(new, config);
                if before != after {
                    ops.extend(diff_string_map(wire, &before, &after));
                }
            }
            MutablePath::Subtree { config, wire } => {
                let before = lookup(old, config);
                let after = lookup(new, config);
                if before == after {
                    continue;
                }
                if !is_declared(after) {
                    if is_declared(before) {
                        ops.push(PatchOperation::Remove { path: wire.to_string() });
                    }
                    continue;
                }
                if projected.is_none() {
                    if let Some(f) = project.take() {
                        projected = Some(f()?);
                    }
                }
                let value = projected.as_ref().and_then(|o| o.pointer(wire)).cloned();
                match (value, is_declared(before)) {
                    (Some(value), true) => ops.push(PatchOperation::Replace { path: wire.to_string(), value }),
                    (Some(value), false) => ops.push(PatchOperation::Add { path: wire.to_string(), value }),
                    (None, true) => ops.push(PatchOperation::Remove { path: wire.to_string() }),
                    (None, false) => {}
                }
            }
        }
    }
    debug!(ops = ops.len(), "patch built");
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn wire_format_matches_json_patch() {
        let ops: PatchOperations = vec![
            PatchOperation::Add { path: "/a".into(), value: json!(1) },
            PatchOperation::replace("/spec/replicas", 0).unwrap(),
            PatchOperation::Remove { path: "/b".into() },
        ]
        .into();
        let s = String::from_utf8(ops.to_bytes().unwrap()).unwrap();
        assert_eq!(
            s,
            r#"[{"op":"add","path":"/a","value":1},{"op":"replace","path":"/spec/replicas","value":0},{"op":"remove","path":"/b"}]"#
        );
        let parsed: json_patch::Patch = serde_json::from_str(&s).unwrap();
        assert_eq!(parsed.0.len(), 3);
    }

    #[test]
    fn string_map_diff_is_per_key() {
        let ops = diff_string_map("/metadata/labels/", &map(&[("a", "1"), ("b", "2"), ("c", "3")]), &map(&[("a", "1"), ("b", "9"), ("d", "4")]));
        assert_eq!(
            ops,
            vec![
                PatchOperation::Remove { path: "/metadata/labels/c".into() },
                PatchOperation::Replace { path: "/metadata/labels/b".into(), value: json!("9") },
                PatchOperation::Add { path: "/metadata/labels/d".into(), value: json!("4") },
            ]
        );
    }

    #[test]
    fn string_map_from_empty_adds_whole_map() {
        let ops = diff_string_map("/metadata/labels", &BTreeMap::new(), &map(&[("app", "web")]));
        assert_eq!(ops, vec![PatchOperation::Add { path: "/metadata/labels".into(), value: json!({"app": "web"}) }]);
    }

    #[test]
    fn keys_are_pointer_escaped() {
        assert_eq!(escape_json_pointer("app.kubernetes.io/name"), "app.kubernetes.io~1name");
        assert_eq!(escape_json_pointer("a~b"), "a~0b");
    }

    const PATHS: &[MutablePath] = &[
        MutablePath::StringMap { config: "metadata.0.labels", wire: "/metadata/labels" },
        MutablePath::Subtree { config: "spec", wire: "/spec" },
    ];

    #[test]
    fn unchanged_trees_produce_no_ops_and_skip_projection() {
        let t = json!({ "metadata": [{ "labels": { "a": "1" } }], "spec": [{ "replicas": 1 }] });
        let ops = build_patch(&t, &t, PATHS, || panic!("projection must not run")).unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn subtree_add_replace_remove() {
        let with = json!({ "spec": [{ "replicas": 2 }] });
        let with_other = json!({ "spec": [{ "replicas": 3 }] });
        let without = json!({});
        let proj = || Ok(json!({ "spec": { "replicas": 3 } }));

        let ops = build_patch(&with, &with_other, PATHS, proj).unwrap();
        assert_eq!(ops, PatchOperations::from(vec![PatchOperation::Replace { path: "/spec".into(), value: json!({"replicas": 3}) }]));

        let ops = build_patch(&without, &with_other, PATHS, proj).unwrap();
        assert_eq!(ops, PatchOperations::from(vec![PatchOperation::Add { path: "/spec".into(), value: json!({"replicas": 3}) }]));

        let ops = build_patch(&with, &without, PATHS, proj).unwrap();
        assert_eq!(ops, PatchOperations::from(vec![PatchOperation::Remove { path: "/spec".into() }]));
    }

    #[test]
    fn whole_map_add_is_split_when_live_map_exists() {
        let paths = &[MutablePath::StringMap { config: "metadata.0.annotations", wire: "/metadata/annotations" }];
        let ops = build_patch(
            &json!({ "metadata": [{}] }),
            &json!({ "metadata": [{ "annotations": { "owner": "a", "x/y": "b" } }] }),
            paths,
            || Ok(Json::Null),
        )
        .unwrap();
        assert!(adds_whole_map(&ops, paths));

        let live = json!({ "metadata": { "annotations": { "deployment.kubernetes.io/revision": "1" } } });
        let rebased = rebase_map_adds(ops.clone(), paths, &live);
        assert!(!adds_whole_map(&rebased, paths));
        assert_eq!(
            rebased,
            PatchOperations::from(vec![
                PatchOperation::Add { path: "/metadata/annotations/owner".into(), value: json!("a") },
                PatchOperation::Add { path: "/metadata/annotations/x~1y".into(), value: json!("b") },
            ])
        );

        let mut doc = live.clone();
        let p: json_patch::Patch = serde_json::from_slice(&rebased.to_bytes().unwrap()).unwrap();
        json_patch::patch(&mut doc, &p.0).unwrap();
        assert_eq!(doc["metadata"]["annotations"]["deployment.kubernetes.io/revision"], "1");

        assert_eq!(rebase_map_adds(ops.clone(), paths, &json!({ "metadata": {} })), ops);
    }

    #[test]
    fn projection_errors_propagate() {
        let a = json!({ "spec": [{ "replicas": 2 }] });
        let b = json!({ "spec": [{ "replicas": 3 }] });
        let err = build_patch(&a, &b, PATHS, || Err(kform_core::Error::invalid_shape("boom"))).unwrap_err();
        assert!(matches!(err, kform_core::Error::InvalidShape(_)));
    }
}
