//! Error taxonomy shared by every kform crate.

use std::time::Duration;

use crate::Progress;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Which external control-API call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Create,
    Get,
    Patch,
    Delete,
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallKind::Create => "create",
            CallKind::Get => "get",
            CallKind::Patch => "patch",
            CallKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Desired configuration is malformed (required block missing, bad scalar).
    #[error("invalid configuration: {0}")]
    InvalidShape(String),

    /// External object is absent. Callers decide what that means.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Transport, authorization or server error from the control API.
    #[error("failed to {call} {kind}: {source}")]
    ExternalCallFailed {
        call: CallKind,
        kind: &'static str,
        #[source]
        source: BoxError,
    },

    /// Convergence polling ran out of budget.
    #[error("timed out after {timeout:?} waiting for {what}{}", .last.as_ref().map(|p| format!(" ({p} observed)")).unwrap_or_default())]
    Timeout {
        what: String,
        timeout: Duration,
        last: Option<Progress>,
    },

    /// A persisted record is newer than any registered migration step.
    #[error("unexpected schema version {found} for {kind} (latest known is {latest})")]
    UnknownVersion { kind: &'static str, found: u32, latest: u32 },

    /// Patch serialization failed.
    #[error("failed to marshal patch operations: {0}")]
    UnmarshalableValue(#[from] serde_json::Error),

    /// Identity missing or not of the form `<namespace>/<name>`.
    #[error("invalid identity {0:?}: expected <namespace>/<name>")]
    InvalidIdentity(String),
}

impl Error {
    pub fn external(call: CallKind, kind: &'static str, source: impl Into<BoxError>) -> Self {
        Error::ExternalCallFailed { call, kind, source: source.into() }
    }

    pub fn invalid_shape(msg: impl Into<String>) -> Self {
        Error::InvalidShape(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}
