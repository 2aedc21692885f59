//! Object metadata shared by every kind.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kform_core::schema::{Field, Presence};
use kform_core::tree::{put_int, put_map, put_str, str_field, string_map, Fields};
use kform_core::{Error, Result};

/// Top-level `metadata` block of a namespaced object.
pub const FIELDS: &[Field] = &[
    Field::string("name", Presence::OptionalComputed),
    Field::string("generate_name", Presence::Optional),
    Field::string("namespace", Presence::OptionalComputed),
    Field::map("labels", Presence::Optional),
    Field::map("annotations", Presence::Optional),
    Field::int("generation", Presence::Computed),
    Field::string("resource_version", Presence::Computed),
    Field::string("self_link", Presence::Computed),
    Field::string("uid", Presence::Computed),
];

/// `metadata` block nested in a pod template.
pub const TEMPLATE_FIELDS: &[Field] = &[
    Field::string("name", Presence::Optional),
    Field::string("generate_name", Presence::Optional),
    Field::map("labels", Presence::Optional),
    Field::map("annotations", Presence::Optional),
];

pub fn expand(fields: &Fields) -> ObjectMeta {
    ObjectMeta {
        name: str_field(fields, "name").map(String::from),
        generate_name: str_field(fields, "generate_name").map(String::from),
        namespace: str_field(fields, "namespace").map(String::from),
        labels: non_empty_map(string_map(fields, "labels")),
        annotations: non_empty_map(string_map(fields, "annotations")),
        ..ObjectMeta::default()
    }
}

/// A top-level object needs a name or a server-side name prefix.
pub fn require_name(fields: &Fields) -> Result<()> {
    if str_field(fields, "name").is_none() && str_field(fields, "generate_name").is_none() {
        return Err(Error::invalid_shape("metadata: one of name or generate_name is required"));
    }
    Ok(())
}

/// Flatten top-level metadata, including server-assigned fields.
pub fn flatten(meta: &ObjectMeta, prior: Option<&Fields>) -> Fields {
    let mut out = flatten_template(meta, prior);
    put_str(&mut out, "namespace", meta.namespace.as_deref());
    put_int(&mut out, "generation", meta.generation);
    put_str(&mut out, "resource_version", meta.resource_version.as_deref());
    put_str(&mut out, "self_link", meta.self_link.as_deref());
    put_str(&mut out, "uid", meta.uid.as_deref());
    out
}

pub fn flatten_template(meta: &ObjectMeta, prior: Option<&Fields>) -> Fields {
    let mut out = Fields::new();
    put_str(&mut out, "name", meta.name.as_deref());
    put_str(&mut out, "generate_name", meta.generate_name.as_deref());
    put_map(&mut out, "labels", &merge_labels(prior, meta.labels.as_ref()));
    put_map(&mut out, "annotations", &filter_annotations(prior, meta.annotations.as_ref()));
    out
}

/// Union of the labels declared in `prior` and those observed; observed
/// values win on collision.
pub fn merge_labels(prior: Option<&Fields>, observed: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    let mut merged = prior.map(|p| string_map(p, "labels")).unwrap_or_default();
    if let Some(observed) = observed {
        merged.extend(observed.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

/// Observed annotations minus server-internal keys the user never declared.
pub fn filter_annotations(prior: Option<&Fields>, observed: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    let declared = prior.map(|p| string_map(p, "annotations")).unwrap_or_default();
    observed
        .into_iter()
        .flatten()
        .filter(|(k, _)| !is_internal_key(k) || declared.contains_key(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Keys under the `kubernetes.io` or `k8s.io` domains (and their subdomains).
pub fn is_internal_key(key: &str) -> bool {
    let Some((domain, _)) = key.split_once('/') else { return false };
    ["kubernetes.io", "k8s.io"]
        .iter()
        .any(|d| domain == *d || domain.strip_suffix(d).is_some_and(|rest| rest.ends_with('.')))
}

fn non_empty_map(m: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!m.is_empty()).then_some(m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: serde_json::Value) -> Fields {
        serde_json::from_value(v).unwrap()
    }

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn observed_labels_win_and_union_with_prior() {
        let prior = fields(json!({ "labels": { "a": "1" } }));
        let merged = merge_labels(Some(&prior), Some(&map(&[("a", "2"), ("b", "3")])));
        assert_eq!(merged, map(&[("a", "2"), ("b", "3")]));
    }

    #[test]
    fn declared_labels_survive_a_read_without_them() {
        let prior = fields(json!({ "labels": { "team": "core" } }));
        let merged = merge_labels(Some(&prior), None);
        assert_eq!(merged, map(&[("team", "core")]));
    }

    #[test]
    fn internal_annotations_are_dropped_unless_declared() {
        let observed = map(&[
            ("deployment.kubernetes.io/revision", "3"),
            ("kubectl.kubernetes.io/last-applied-configuration", "{}"),
            ("example.com/owner", "me"),
        ]);
        let prior = fields(json!({ "annotations": { "kubectl.kubernetes.io/last-applied-configuration": "{}" } }));
        let out = filter_annotations(Some(&prior), Some(&observed));
        assert_eq!(
            out,
            map(&[("example.com/owner", "me"), ("kubectl.kubernetes.io/last-applied-configuration", "{}")])
        );
    }

    #[test]
    fn internal_key_matches_domains_only() {
        assert!(is_internal_key("kubernetes.io/change-cause"));
        assert!(is_internal_key("node.k8s.io/x"));
        assert!(!is_internal_key("notkubernetes.io/x"));
        assert!(!is_internal_key("app"));
    }

    #[test]
    fn name_or_generate_name_is_required() {
        assert!(matches!(require_name(&fields(json!({ "labels": {} }))), Err(Error::InvalidShape(_))));
        assert!(require_name(&fields(json!({ "generate_name": "web-" }))).is_ok());
    }

    #[test]
    fn flatten_surfaces_computed_fields() {
        let meta = ObjectMeta {
            name: Some("web".into()),
            namespace: Some("default".into()),
            uid: Some("u-1".into()),
            generation: Some(2),
            ..ObjectMeta::default()
        };
        let out = flatten(&meta, None);
        assert_eq!(out["uid"], "u-1");
        assert_eq!(out["generation"], 2);
        assert!(out.get("labels").is_none());
    }
}
