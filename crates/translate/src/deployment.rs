//! `apps/v1` Deployment: schema, translation, mutable paths and migrations.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus, DeploymentStrategy, RollingUpdateDeployment};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kform_core::schema::{DefaultValue, Field, Presence};
use kform_core::tree::{
    block, bool_field, int_field, put_bool, put_int, put_map, put_str, root_block, singular, str_field, string_map, Fields,
};
use kform_core::{Attributes, Progress, Result};
use kform_migrate::{insert_default, rename, Migrator, Rename, Step};
use kform_patch::{MutablePath, PatchOperation, PatchOperations};
use serde_json::Value as Json;
use tracing::debug;

use crate::{int32, metadata, pod, required_block, root_fields};

pub const KIND: &str = "deployment";

pub const DEFAULT_MIN_READY_SECONDS: i64 = 0;
pub const DEFAULT_PAUSED: bool = false;
pub const DEFAULT_PROGRESS_DEADLINE_SECONDS: i64 = 600;
pub const DEFAULT_REPLICAS: i64 = 1;
pub const DEFAULT_REVISION_HISTORY_LIMIT: i64 = 10;
pub const DEFAULT_MAX_SURGE: &str = "1";
pub const DEFAULT_MAX_UNAVAILABLE: &str = "1";

const ROLLING_UPDATE_FIELDS: &[Field] = &[
    Field::string("max_surge", Presence::Optional).with_default(DefaultValue::Str(DEFAULT_MAX_SURGE)),
    Field::string("max_unavailable", Presence::Optional).with_default(DefaultValue::Str(DEFAULT_MAX_UNAVAILABLE)),
];

const STRATEGY_FIELDS: &[Field] = &[
    Field::string("type", Presence::Optional),
    Field::single("rolling_update", ROLLING_UPDATE_FIELDS, Presence::Optional),
];

const TEMPLATE_FIELDS: &[Field] = &[
    Field::single("metadata", metadata::TEMPLATE_FIELDS, Presence::Optional),
    Field::single("spec", pod::FIELDS, Presence::Required),
];

const SPEC_FIELDS: &[Field] = &[
    Field::int("min_ready_seconds", Presence::Optional).with_default(DefaultValue::Int(DEFAULT_MIN_READY_SECONDS)),
    Field::bool("paused", Presence::Optional).with_default(DefaultValue::Bool(DEFAULT_PAUSED)),
    Field::int("progress_deadline_seconds", Presence::Optional)
        .with_default(DefaultValue::Int(DEFAULT_PROGRESS_DEADLINE_SECONDS)),
    Field::int("replicas", Presence::Optional).with_default(DefaultValue::Int(DEFAULT_REPLICAS)),
    Field::int("revision_history_limit", Presence::Optional).with_default(DefaultValue::Int(DEFAULT_REVISION_HISTORY_LIMIT)),
    Field::map("selector", Presence::OptionalComputed),
    Field::single("strategy", STRATEGY_FIELDS, Presence::OptionalComputed),
    Field::single("template", TEMPLATE_FIELDS, Presence::Required),
];

const STATUS_FIELDS: &[Field] = &[
    Field::int("replicas", Presence::Computed),
    Field::int("ready_replicas", Presence::Computed),
    Field::int("available_replicas", Presence::Computed),
    Field::int("updated_replicas", Presence::Computed),
    Field::int("observed_generation", Presence::Computed),
];

pub const FIELDS: &[Field] = &[
    Field::single("metadata", metadata::FIELDS, Presence::Required),
    Field::single("spec", SPEC_FIELDS, Presence::Required),
    Field::single("status", STATUS_FIELDS, Presence::Computed),
];

pub const MUTABLE_PATHS: &[MutablePath] = &[
    MutablePath::StringMap { config: "metadata.0.labels", wire: "/metadata/labels" },
    MutablePath::StringMap { config: "metadata.0.annotations", wire: "/metadata/annotations" },
    MutablePath::Subtree { config: "spec", wire: "/spec" },
];

const STEPS: &[Step] = &[migrate_v0_to_v1, migrate_v1_to_v2];
pub const MIGRATOR: Migrator = Migrator::new(KIND, STEPS);

pub fn expand(tree: &Json) -> Result<Deployment> {
    let root = root_fields(tree)?;
    let meta = required_block(root, "metadata", "metadata")?;
    metadata::require_name(meta)?;
    let spec = required_block(root, "spec", "spec")?;
    Ok(Deployment { metadata: metadata::expand(meta), spec: Some(expand_spec(spec)?), ..Deployment::default() })
}

fn expand_spec(spec: &Fields) -> Result<DeploymentSpec> {
    let template = required_block(spec, "template", "spec.template")?;
    let pod_spec = required_block(template, "spec", "spec.template.spec")?;
    let template_meta = block(template, "metadata").map(metadata::expand).unwrap_or_default();

    let mut match_labels = string_map(spec, "selector");
    if match_labels.is_empty() {
        match_labels = template_meta.labels.clone().unwrap_or_default();
    }

    let int = |key: &str, default: i64| int32(int_field(spec, key).unwrap_or(default), &format!("spec.{}", key));
    Ok(DeploymentSpec {
        min_ready_seconds: Some(int("min_ready_seconds", DEFAULT_MIN_READY_SECONDS)?),
        paused: Some(bool_field(spec, "paused").unwrap_or(DEFAULT_PAUSED)),
        progress_deadline_seconds: Some(int("progress_deadline_seconds", DEFAULT_PROGRESS_DEADLINE_SECONDS)?),
        replicas: Some(int("replicas", DEFAULT_REPLICAS)?),
        revision_history_limit: Some(int("revision_history_limit", DEFAULT_REVISION_HISTORY_LIMIT)?),
        selector: LabelSelector {
            match_labels: (!match_labels.is_empty()).then_some(match_labels),
            ..LabelSelector::default()
        },
        strategy: block(spec, "strategy").map(expand_strategy),
        template: PodTemplateSpec { metadata: Some(template_meta), spec: Some(pod::expand(pod_spec)?) },
    })
}

fn expand_strategy(fields: &Fields) -> DeploymentStrategy {
    DeploymentStrategy {
        type_: str_field(fields, "type").map(String::from),
        rolling_update: block(fields, "rolling_update").map(|r| RollingUpdateDeployment {
            max_surge: Some(int_or_string(&scalar_string(r, "max_surge").unwrap_or_else(|| DEFAULT_MAX_SURGE.into()))),
            max_unavailable: Some(int_or_string(
                &scalar_string(r, "max_unavailable").unwrap_or_else(|| DEFAULT_MAX_UNAVAILABLE.into()),
            )),
        }),
    }
}

/// String field that also accepts a bare integer (`max_surge: 2`).
fn scalar_string(fields: &Fields, key: &str) -> Option<String> {
    match fields.get(key)? {
        Json::String(s) if !s.is_empty() => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `"3"` becomes an integer, anything else (`"25%"`) stays a string.
pub fn int_or_string(s: &str) -> IntOrString {
    match s.parse::<i32>() {
        Ok(i) => IntOrString::Int(i),
        Err(_) => IntOrString::String(s.to_string()),
    }
}

fn int_or_string_text(v: &IntOrString) -> String {
    match v {
        IntOrString::Int(i) => i.to_string(),
        IntOrString::String(s) => s.clone(),
    }
}

/// Observed object back to a tree, reconciled against `prior`.
pub fn flatten(obj: &Deployment, prior: &Json) -> Json {
    let prior_meta = root_block(prior, "metadata");
    let prior_spec = root_block(prior, "spec");

    let mut root = Fields::new();
    root.insert("metadata".into(), singular(metadata::flatten(&obj.metadata, prior_meta)));
    if let Some(spec) = &obj.spec {
        root.insert("spec".into(), singular(flatten_spec(spec, prior_spec)));
    }
    if let Some(status) = &obj.status {
        root.insert("status".into(), singular(flatten_status(status)));
    }
    Json::Object(root)
}

fn flatten_spec(spec: &DeploymentSpec, prior: Option<&Fields>) -> Fields {
    let mut out = Fields::new();
    let int = |v: Option<i32>, default: i64| Some(v.map(i64::from).unwrap_or(default));
    put_int(&mut out, "min_ready_seconds", int(spec.min_ready_seconds, DEFAULT_MIN_READY_SECONDS));
    put_bool(&mut out, "paused", Some(spec.paused.unwrap_or(DEFAULT_PAUSED)));
    put_int(&mut out, "progress_deadline_seconds", int(spec.progress_deadline_seconds, DEFAULT_PROGRESS_DEADLINE_SECONDS));
    put_int(&mut out, "replicas", int(spec.replicas, DEFAULT_REPLICAS));
    put_int(&mut out, "revision_history_limit", int(spec.revision_history_limit, DEFAULT_REVISION_HISTORY_LIMIT));
    put_map(&mut out, "selector", &spec.selector.match_labels.clone().unwrap_or_default());

    if let Some(strategy) = &spec.strategy {
        let mut s = Fields::new();
        put_str(&mut s, "type", strategy.type_.as_deref());
        if let Some(ru) = &strategy.rolling_update {
            let mut r = Fields::new();
            put_str(&mut r, "max_surge", ru.max_surge.as_ref().map(int_or_string_text).as_deref());
            put_str(&mut r, "max_unavailable", ru.max_unavailable.as_ref().map(int_or_string_text).as_deref());
            s.insert("rolling_update".into(), singular(r));
        }
        out.insert("strategy".into(), singular(s));
    }

    let prior_template = prior.and_then(|p| block(p, "template"));
    let mut template = Fields::new();
    if let Some(meta) = &spec.template.metadata {
        let flat = metadata::flatten_template(meta, prior_template.and_then(|t| block(t, "metadata")));
        if !flat.is_empty() {
            template.insert("metadata".into(), singular(flat));
        }
    }
    if let Some(pod_spec) = &spec.template.spec {
        template.insert("spec".into(), singular(pod::flatten(pod_spec)));
    }
    out.insert("template".into(), singular(template));
    out
}

fn flatten_status(status: &DeploymentStatus) -> Fields {
    let mut out = Fields::new();
    put_int(&mut out, "replicas", status.replicas.map(i64::from));
    put_int(&mut out, "ready_replicas", status.ready_replicas.map(i64::from));
    put_int(&mut out, "available_replicas", status.available_replicas.map(i64::from));
    put_int(&mut out, "updated_replicas", status.updated_replicas.map(i64::from));
    put_int(&mut out, "observed_generation", status.observed_generation);
    out
}

/// Observed vs desired replica count.
pub fn progress(obj: &Deployment) -> Progress {
    let desired = obj.spec.as_ref().and_then(|s| s.replicas).map(i64::from).unwrap_or(DEFAULT_REPLICAS);
    let observed = obj.status.as_ref().and_then(|s| s.replicas).map(i64::from).unwrap_or(0);
    Progress::new(observed, desired)
}

/// Scale to zero ahead of deletion.
pub fn drain_patch() -> Result<PatchOperations> {
    Ok(vec![PatchOperation::replace("/spec/replicas", 0)?].into())
}

const TEMPLATE_PREFIX: &str = "spec.0.template.0.";

/// v0 kept `name` at the top level and pod fields directly under the template.
fn migrate_v0_to_v1(attrs: &mut Attributes) {
    if rename(attrs, "name", "metadata.0.name") == Rename::Moved {
        insert_default(attrs, "metadata.#", "1");
    }
    let pod_keys: Vec<String> = attrs
        .keys()
        .filter(|k| {
            k.strip_prefix(TEMPLATE_PREFIX)
                .is_some_and(|rest| !(rest.starts_with("spec.") || rest.starts_with("metadata.")))
        })
        .cloned()
        .collect();
    let mut moved = 0usize;
    for key in pod_keys {
        let rest = &key[TEMPLATE_PREFIX.len()..];
        let to = format!("{}spec.0.{}", TEMPLATE_PREFIX, rest);
        if rename(attrs, &key, &to) == Rename::Moved {
            moved += 1;
        }
    }
    if moved > 0 {
        insert_default(attrs, "spec.0.template.0.spec.#", "1");
    }
    debug!(moved, "moved pod template fields under spec");
}

/// v2 introduced `paused` and `progress_deadline_seconds`.
fn migrate_v1_to_v2(attrs: &mut Attributes) {
    insert_default(attrs, "spec.0.paused", DEFAULT_PAUSED.to_string());
    insert_default(attrs, "spec.0.progress_deadline_seconds", DEFAULT_PROGRESS_DEADLINE_SECONDS.to_string());
}
