//! Static field schema for configuration trees.
//!
//! Resource kinds declare their tree shape once as `&'static [Field]`; the
//! flatmap codec uses it to rebuild typed trees from string-valued records,
//! and [`normalize`] uses it to fill declared defaults and carry computed
//! values forward before two trees are compared.

use serde_json::Value as Json;

use crate::tree::Fields;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Required,
    Optional,
    /// Optional in desired input; populated from observed state after read.
    OptionalComputed,
    /// Never set by the user.
    Computed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultValue {
    Int(i64),
    Bool(bool),
    Str(&'static str),
}

impl DefaultValue {
    pub fn to_json(&self) -> Json {
        match self {
            DefaultValue::Int(v) => Json::from(*v),
            DefaultValue::Bool(v) => Json::Bool(*v),
            DefaultValue::Str(v) => Json::String((*v).to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FieldType {
    String,
    Int,
    Bool,
    StringList,
    StringMap,
    Block { fields: &'static [Field], singular: bool },
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub ty: FieldType,
    pub presence: Presence,
    pub default: Option<DefaultValue>,
}

impl Field {
    pub const fn new(name: &'static str, ty: FieldType, presence: Presence) -> Self {
        Self { name, ty, presence, default: None }
    }

    pub const fn string(name: &'static str, presence: Presence) -> Self {
        Self::new(name, FieldType::String, presence)
    }

    pub const fn int(name: &'static str, presence: Presence) -> Self {
        Self::new(name, FieldType::Int, presence)
    }

    pub const fn bool(name: &'static str, presence: Presence) -> Self {
        Self::new(name, FieldType::Bool, presence)
    }

    pub const fn list(name: &'static str, presence: Presence) -> Self {
        Self::new(name, FieldType::StringList, presence)
    }

    pub const fn map(name: &'static str, presence: Presence) -> Self {
        Self::new(name, FieldType::StringMap, presence)
    }

    pub const fn single(name: &'static str, fields: &'static [Field], presence: Presence) -> Self {
        Self::new(name, FieldType::Block { fields, singular: true }, presence)
    }

    pub const fn repeated(name: &'static str, fields: &'static [Field], presence: Presence) -> Self {
        Self::new(name, FieldType::Block { fields, singular: false }, presence)
    }

    pub const fn with_default(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }
}

/// Fill absent fields of `desired`: computed fields take the value held in
/// `prior`, others take their declared default. Only blocks present in
/// `desired` are visited; repeated blocks pair with `prior` by index.
pub fn normalize(desired: &Json, prior: Option<&Json>, fields: &'static [Field]) -> Json {
    match desired.as_object() {
        Some(d) => Json::Object(normalize_block(d, prior.and_then(|p| p.as_object()), fields)),
        None => desired.clone(),
    }
}

fn normalize_block(desired: &Fields, prior: Option<&Fields>, fields: &'static [Field]) -> Fields {
    let mut out = desired.clone();
    for f in fields {
        let prior_value = prior.and_then(|p| p.get(f.name));
        match out.get_mut(f.name) {
            None => {
                let carried = matches!(f.presence, Presence::OptionalComputed | Presence::Computed)
                    .then(|| prior_value.cloned())
                    .flatten();
                if let Some(v) = carried.or_else(|| f.default.map(|d| d.to_json())) {
                    out.insert(f.name.to_string(), v);
                }
            }
            Some(Json::Array(elems)) => {
                if let FieldType::Block { fields: inner, .. } = f.ty {
                    let prior_elems = prior_value.and_then(|v| v.as_array());
                    for (i, elem) in elems.iter_mut().enumerate() {
                        if let Some(obj) = elem.as_object() {
                            let p = prior_elems.and_then(|a| a.get(i)).and_then(|v| v.as_object());
                            *elem = Json::Object(normalize_block(obj, p, inner));
                        }
                    }
                }
            }
            Some(_) => {}
        }
    }
    out
}
