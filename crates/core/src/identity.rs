use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const SEPARATOR: char = '/';

/// External identity of a namespaced object: `<namespace>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    namespace: String,
    name: String,
}

impl Identity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let name = name.into();
        if namespace.is_empty() || name.is_empty() || namespace.contains(SEPARATOR) || name.contains(SEPARATOR) {
            return Err(Error::InvalidIdentity(format!("{}{}{}", namespace, SEPARATOR, name)));
        }
        Ok(Self { namespace, name })
    }

    /// Build from the namespace/name of an object returned by the control API.
    pub fn from_parts(namespace: Option<&str>, name: Option<&str>) -> Result<Self> {
        Self::new(namespace.unwrap_or_default(), name.unwrap_or_default())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parse an optional stored id; an empty id means "not created".
    pub fn parse_stored(id: &str) -> Result<Option<Self>> {
        if id.is_empty() {
            return Ok(None);
        }
        id.parse().map(Some)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.namespace, SEPARATOR, self.name)
    }
}

impl std::str::FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(SEPARATOR) {
            Some((ns, name)) => Identity::new(ns, name).map_err(|_| Error::InvalidIdentity(s.to_string())),
            None => Err(Error::InvalidIdentity(s.to_string())),
        }
    }
}
