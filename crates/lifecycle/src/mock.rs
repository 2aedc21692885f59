//! In-memory control API. Applies JSON patches for real, simulates status
//! progress on every read and records the order of calls.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::Metadata;
use kform_core::{CallKind, Error, Result};
use serde_json::Value as Json;

use crate::control::ControlApi;
use crate::kind::{DeploymentKind, Propagation, ResourceKind};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Create { namespace: String, name: String },
    Get { namespace: String, name: String },
    Patch { namespace: String, name: String, ops: Json },
    Delete { namespace: String, name: String, propagation: Propagation },
}

impl Call {
    pub fn kind(&self) -> CallKind {
        match self {
            Call::Create { .. } => CallKind::Create,
            Call::Get { .. } => CallKind::Get,
            Call::Patch { .. } => CallKind::Patch,
            Call::Delete { .. } => CallKind::Delete,
        }
    }
}

type Hook<O> = Box<dyn FnMut(&mut O) + Send>;
type Failure = Box<dyn Fn() -> Error + Send>;

struct State<O> {
    objects: BTreeMap<(String, String), O>,
    calls: Vec<Call>,
    on_get: Option<Hook<O>>,
    failures: Vec<(CallKind, Failure)>,
    serial: u64,
}

impl<O> State<O> {
    fn failure(&self, call: CallKind) -> Option<Error> {
        self.failures.iter().find(|(c, _)| *c == call).map(|(_, f)| f())
    }

    fn next_serial(&mut self) -> u64 {
        self.serial += 1;
        self.serial
    }
}

pub struct MockControl<K: ResourceKind> {
    state: Mutex<State<K::Object>>,
}

impl<K: ResourceKind> Default for MockControl<K> {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                calls: Vec::new(),
                on_get: None,
                failures: Vec::new(),
                serial: 0,
            }),
        }
    }
}

impl<K: ResourceKind> MockControl<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` against the stored object on every `get` before it is returned.
    pub fn with_progress(hook: impl FnMut(&mut K::Object) + Send + 'static) -> Self {
        let mock = Self::default();
        mock.lock().on_get = Some(Box::new(hook));
        mock
    }

    /// Make every call of `call` kind fail with the error built by `f`.
    pub fn fail(&self, call: CallKind, f: impl Fn() -> Error + Send + 'static) {
        self.lock().failures.push((call, Box::new(f)));
    }

    /// Seed an object as if it had been created out of band.
    pub fn insert(&self, namespace: &str, obj: K::Object) {
        let name = obj.metadata().name.clone().unwrap_or_default();
        self.lock().objects.insert((namespace.to_string(), name), obj);
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<K::Object> {
        self.lock().objects.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State<K::Object>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn not_found(namespace: &str, name: &str) -> Error {
        Error::NotFound { kind: K::KIND, id: format!("{}/{}", namespace, name) }
    }
}

impl MockControl<DeploymentKind> {
    /// Observed replicas move one step toward `spec.replicas` on every `get`.
    pub fn rolling() -> Self {
        Self::with_progress(|d: &mut Deployment| {
            let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            let status = d.status.get_or_insert_with(DeploymentStatus::default);
            let current = status.replicas.unwrap_or(0);
            let next = current + (desired - current).signum();
            status.replicas = Some(next);
            status.ready_replicas = Some(next);
            status.updated_replicas = Some(next);
            status.available_replicas = Some(next);
        })
    }
}

#[async_trait]
impl<K: ResourceKind> ControlApi<K> for MockControl<K> {
    async fn create(&self, namespace: &str, obj: &K::Object) -> Result<K::Object> {
        let mut st = self.lock();
        let meta = obj.metadata();
        let requested = meta.name.clone().unwrap_or_default();
        st.calls.push(Call::Create { namespace: namespace.to_string(), name: requested.clone() });
        if let Some(e) = st.failure(CallKind::Create) {
            return Err(e);
        }
        let serial = st.next_serial();
        let name = match (requested.is_empty(), meta.generate_name.as_deref()) {
            (true, Some(prefix)) => format!("{}{}", prefix, serial),
            _ => requested,
        };
        let key = (namespace.to_string(), name.clone());
        if st.objects.contains_key(&key) {
            return Err(Error::external(CallKind::Create, K::KIND, format!("{}/{} already exists", namespace, name)));
        }
        let mut created = obj.clone();
        let m = created.metadata_mut();
        m.name = Some(name);
        m.namespace = Some(namespace.to_string());
        m.uid = Some(format!("mock-uid-{}", serial));
        m.resource_version = Some(serial.to_string());
        m.generation = Some(1);
        st.objects.insert(key, created.clone());
        Ok(created)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<K::Object> {
        let mut st = self.lock();
        st.calls.push(Call::Get { namespace: namespace.to_string(), name: name.to_string() });
        if let Some(e) = st.failure(CallKind::Get) {
            return Err(e);
        }
        let State { objects, on_get, .. } = &mut *st;
        let obj = objects
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Self::not_found(namespace, name))?;
        if let Some(hook) = on_get.as_mut() {
            hook(obj);
        }
        Ok(obj.clone())
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &[u8]) -> Result<K::Object> {
        let ops: Json = serde_json::from_slice(patch)?;
        let mut st = self.lock();
        st.calls.push(Call::Patch { namespace: namespace.to_string(), name: name.to_string(), ops: ops.clone() });
        if let Some(e) = st.failure(CallKind::Patch) {
            return Err(e);
        }
        let key = (namespace.to_string(), name.to_string());
        let current = st.objects.get(&key).ok_or_else(|| Self::not_found(namespace, name))?;
        let mut doc = serde_json::to_value(current)?;
        let p: json_patch::Patch = serde_json::from_value(ops)?;
        json_patch::patch(&mut doc, &p.0).map_err(|e| Error::external(CallKind::Patch, K::KIND, e))?;
        let mut patched: K::Object = serde_json::from_value(doc)?;
        let serial = st.next_serial();
        let m = patched.metadata_mut();
        m.generation = Some(m.generation.unwrap_or(0) + 1);
        m.resource_version = Some(serial.to_string());
        st.objects.insert(key, patched.clone());
        Ok(patched)
    }

    async fn delete(&self, namespace: &str, name: &str, propagation: Propagation) -> Result<()> {
        let mut st = self.lock();
        st.calls.push(Call::Delete { namespace: namespace.to_string(), name: name.to_string(), propagation });
        if let Some(e) = st.failure(CallKind::Delete) {
            return Err(e);
        }
        st.objects
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Self::not_found(namespace, name))
    }
}
