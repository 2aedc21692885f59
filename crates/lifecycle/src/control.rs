//! External control API consumed by the controller, and its kube-rs backend.

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kform_core::{CallKind, Error, Result};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::Client;
use tracing::debug;

use crate::kind::{Propagation, ResourceKind};

/// Typed create/get/patch/delete for one kind. `NotFound` must be reported
/// distinctly from every other failure.
#[async_trait]
pub trait ControlApi<K: ResourceKind>: Send + Sync {
    async fn create(&self, namespace: &str, obj: &K::Object) -> Result<K::Object>;
    async fn get(&self, namespace: &str, name: &str) -> Result<K::Object>;
    /// `patch` is a JSON-Patch document.
    async fn patch(&self, namespace: &str, name: &str, patch: &[u8]) -> Result<K::Object>;
    async fn delete(&self, namespace: &str, name: &str, propagation: Propagation) -> Result<()>;
}

/// Control API backed by a kube-rs client.
#[derive(Clone)]
pub struct KubeControl {
    client: Client,
}

impl KubeControl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<O>(&self, namespace: &str) -> Api<O>
    where
        O: kube::Resource<Scope = NamespaceResourceScope>,
        O::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_kube_err(call: CallKind, kind: &'static str, namespace: &str, name: &str, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound { kind, id: format!("{}/{}", namespace, name) },
        other => Error::external(call, kind, other),
    }
}

impl From<Propagation> for PropagationPolicy {
    fn from(p: Propagation) -> Self {
        match p {
            Propagation::Foreground => PropagationPolicy::Foreground,
            Propagation::Background => PropagationPolicy::Background,
        }
    }
}

#[async_trait]
impl<K> ControlApi<K> for KubeControl
where
    K: ResourceKind,
    K::Object: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    async fn create(&self, namespace: &str, obj: &K::Object) -> Result<K::Object> {
        let name = kube::Resource::meta(obj).name.clone().unwrap_or_default();
        debug!(kind = K::KIND, namespace, name = %name, "kube: create");
        self.api::<K::Object>(namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_err(CallKind::Create, K::KIND, namespace, &name, e))
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<K::Object> {
        debug!(kind = K::KIND, namespace, name, "kube: get");
        self.api::<K::Object>(namespace)
            .get(name)
            .await
            .map_err(|e| map_kube_err(CallKind::Get, K::KIND, namespace, name, e))
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &[u8]) -> Result<K::Object> {
        let patch: json_patch::Patch = serde_json::from_slice(patch)?;
        debug!(kind = K::KIND, namespace, name, ops = patch.0.len(), "kube: json patch");
        self.api::<K::Object>(namespace)
            .patch(name, &PatchParams::default(), &Patch::<()>::Json(patch))
            .await
            .map_err(|e| map_kube_err(CallKind::Patch, K::KIND, namespace, name, e))
    }

    async fn delete(&self, namespace: &str, name: &str, propagation: Propagation) -> Result<()> {
        debug!(kind = K::KIND, namespace, name, ?propagation, "kube: delete");
        let dp = DeleteParams { propagation_policy: Some(propagation.into()), ..DeleteParams::default() };
        self.api::<K::Object>(namespace)
            .delete(name, &dp)
            .await
            .map(|_| ())
            .map_err(|e| map_kube_err(CallKind::Delete, K::KIND, namespace, name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{} from server", reason),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn status_404_is_not_found() {
        let err = map_kube_err(CallKind::Get, "deployment", "prod", "web", api_error(404, "NotFound"));
        assert!(err.is_not_found());
        assert!(matches!(err, Error::NotFound { kind: "deployment", ref id } if id == "prod/web"));
    }

    #[test]
    fn other_statuses_keep_the_failed_call() {
        let err = map_kube_err(CallKind::Patch, "deployment", "prod", "web", api_error(500, "InternalError"));
        assert!(!err.is_not_found());
        assert!(matches!(err, Error::ExternalCallFailed { call: CallKind::Patch, kind: "deployment", .. }));
        assert!(err.to_string().starts_with("failed to patch deployment"));

        let err = map_kube_err(CallKind::Delete, "role", "team", "reader", api_error(403, "Forbidden"));
        assert!(matches!(err, Error::ExternalCallFailed { call: CallKind::Delete, .. }));
    }

    #[test]
    fn propagation_maps_to_delete_policy() {
        assert!(matches!(PropagationPolicy::from(Propagation::Foreground), PropagationPolicy::Foreground));
        assert!(matches!(PropagationPolicy::from(Propagation::Background), PropagationPolicy::Background));
    }
}
