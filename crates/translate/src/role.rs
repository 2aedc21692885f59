//! `rbac.authorization.k8s.io/v1` Role.

use k8s_openapi::api::rbac::v1::{PolicyRule, Role};
use kform_core::schema::{Field, Presence};
use kform_core::tree::{blocks, put_blocks, put_list, root_block, singular, string_list, Fields};
use kform_core::{Error, Result};
use kform_migrate::Migrator;
use kform_patch::MutablePath;
use serde_json::Value as Json;

use crate::{metadata, non_empty, required_block, root_fields};

pub const KIND: &str = "role";

const POLICY_RULE_FIELDS: &[Field] = &[
    Field::list("api_groups", Presence::Optional),
    Field::list("non_resource_urls", Presence::Optional),
    Field::list("resource_names", Presence::Optional),
    Field::list("resources", Presence::Optional),
    Field::list("verbs", Presence::Required),
];

pub const FIELDS: &[Field] = &[
    Field::single("metadata", metadata::FIELDS, Presence::Required),
    Field::repeated("policy_rule", POLICY_RULE_FIELDS, Presence::Optional),
];

pub const MUTABLE_PATHS: &[MutablePath] = &[
    MutablePath::StringMap { config: "metadata.0.labels", wire: "/metadata/labels" },
    MutablePath::StringMap { config: "metadata.0.annotations", wire: "/metadata/annotations" },
    MutablePath::Subtree { config: "policy_rule", wire: "/rules" },
];

pub const MIGRATOR: Migrator = Migrator::new(KIND, &[]);

pub fn expand(tree: &Json) -> Result<Role> {
    let root = root_fields(tree)?;
    let meta = required_block(root, "metadata", "metadata")?;
    metadata::require_name(meta)?;
    let rules = blocks(root, "policy_rule")
        .enumerate()
        .map(|(i, r)| expand_rule(r, i))
        .collect::<Result<Vec<_>>>()?;
    Ok(Role { metadata: metadata::expand(meta), rules: non_empty(rules) })
}

fn expand_rule(fields: &Fields, index: usize) -> Result<PolicyRule> {
    let verbs = string_list(fields, "verbs");
    if verbs.is_empty() {
        return Err(Error::invalid_shape(format!("policy_rule.{}: verbs must not be empty", index)));
    }
    Ok(PolicyRule {
        api_groups: non_empty(string_list(fields, "api_groups")),
        non_resource_urls: non_empty(string_list(fields, "non_resource_urls")),
        resource_names: non_empty(string_list(fields, "resource_names")),
        resources: non_empty(string_list(fields, "resources")),
        verbs,
    })
}

pub fn flatten(obj: &Role, prior: &Json) -> Json {
    let mut root = Fields::new();
    root.insert("metadata".into(), singular(metadata::flatten(&obj.metadata, root_block(prior, "metadata"))));
    let rules = obj
        .rules
        .iter()
        .flatten()
        .map(|r| {
            let mut f = Fields::new();
            put_list(&mut f, "api_groups", r.api_groups.as_deref().unwrap_or_default());
            put_list(&mut f, "non_resource_urls", r.non_resource_urls.as_deref().unwrap_or_default());
            put_list(&mut f, "resource_names", r.resource_names.as_deref().unwrap_or_default());
            put_list(&mut f, "resources", r.resources.as_deref().unwrap_or_default());
            put_list(&mut f, "verbs", &r.verbs);
            f
        })
        .collect();
    put_blocks(&mut root, "policy_rule", rules);
    Json::Object(root)
}
