//! Resource lifecycle controller: orders external calls, owns identity and
//! translates between trees, typed objects and flat records.

use std::marker::PhantomData;
use std::time::{Duration, Instant};

use k8s_openapi::Metadata;
use kform_converge::wait_for_convergence;
use kform_core::flatmap::{from_attributes, to_attributes};
use kform_core::schema::normalize;
use kform_core::{Error, Identity, Progress, Result, StateRecord, Tree};
use kform_patch::{adds_whole_map, build_patch, rebase_map_adds, PatchOperations};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::control::ControlApi;
use crate::kind::ResourceKind;

/// Configuration tree plus the identity assigned at creation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceData {
    /// `None` until the external create succeeds, and again after delete.
    pub id: Option<Identity>,
    pub config: Tree,
}

impl ResourceData {
    pub fn new(config: Tree) -> Self {
        Self { id: None, config }
    }

    pub fn identity(&self) -> Result<&Identity> {
        self.id.as_ref().ok_or_else(|| Error::InvalidIdentity(String::new()))
    }
}

/// Outcome of an existence probe.
#[derive(Debug)]
pub enum Existence {
    Present,
    Absent,
    /// The probe failed for a reason other than not-found.
    Unknown(Error),
}

impl Existence {
    /// Legacy `(exists, error)` pair: an ambiguous failure reports `true`
    /// alongside the error.
    pub fn into_compat(self) -> (bool, Option<Error>) {
        match self {
            Existence::Present => (true, None),
            Existence::Absent => (false, None),
            Existence::Unknown(e) => (true, Some(e)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Create,
    Read,
    Update,
    Delete,
    Exists,
}

impl Op {
    fn metric_names(self) -> (&'static str, &'static str) {
        match self {
            Op::Create => ("lifecycle_create_total", "lifecycle_create_err"),
            Op::Read => ("lifecycle_read_total", "lifecycle_read_err"),
            Op::Update => ("lifecycle_update_total", "lifecycle_update_err"),
            Op::Delete => ("lifecycle_delete_total", "lifecycle_delete_err"),
            Op::Exists => ("lifecycle_exists_total", "lifecycle_exists_err"),
        }
    }
}

fn record(op: Op, failed: bool, started: Instant) {
    let (total, err) = op.metric_names();
    counter!(total, 1u64);
    if failed {
        counter!(err, 1u64);
    }
    histogram!("lifecycle_op_ms", started.elapsed().as_secs_f64() * 1000.0);
}

/// Upgrade a persisted record to the current schema version.
pub fn migrate_record<K: ResourceKind>(record: StateRecord) -> Result<StateRecord> {
    K::migrator().migrate_record(record)
}

/// Migrate and decode a persisted record.
pub fn load<K: ResourceKind>(record: StateRecord) -> Result<ResourceData> {
    let record = migrate_record::<K>(record)?;
    Ok(ResourceData {
        id: Identity::parse_stored(&record.id)?,
        config: from_attributes(&record.attributes, K::schema())?,
    })
}

/// Encode for persistence, stamped with the current schema version.
pub fn store<K: ResourceKind>(data: &ResourceData) -> StateRecord {
    StateRecord {
        id: data.id.as_ref().map(Identity::to_string).unwrap_or_default(),
        schema_version: K::migrator().latest(),
        attributes: to_attributes(&data.config, K::schema()),
    }
}

/// Patch an update from `old` to `new` would submit.
pub fn plan<K: ResourceKind>(old: &Tree, new: &Tree) -> Result<PatchOperations> {
    let desired = normalize(new, Some(old), K::schema());
    diff::<K>(old, &desired)
}

/// The desired tree is expanded up front so a malformed tree fails before
/// any operation is built.
fn diff<K: ResourceKind>(old: &Tree, desired: &Tree) -> Result<PatchOperations> {
    let projected = serde_json::to_value(K::expand(desired)?)?;
    build_patch(old, desired, K::mutable_paths(), || Ok(projected))
}

pub struct Controller<K: ResourceKind, A> {
    api: A,
    config: ControllerConfig,
    _kind: PhantomData<fn() -> K>,
}

impl<K, A> Controller<K, A>
where
    K: ResourceKind,
    A: ControlApi<K>,
{
    pub fn new(api: A, config: ControllerConfig) -> Self {
        Self { api, config, _kind: PhantomData }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn migrate(&self, record: StateRecord) -> Result<StateRecord> {
        migrate_record::<K>(record)
    }

    pub fn load(&self, record: StateRecord) -> Result<ResourceData> {
        load::<K>(record)
    }

    pub fn store(&self, data: &ResourceData) -> StateRecord {
        store::<K>(data)
    }

    pub fn plan(&self, old: &Tree, new: &Tree) -> Result<PatchOperations> {
        plan::<K>(old, new)
    }

    pub async fn create(&self, data: &mut ResourceData) -> Result<()> {
        let started = Instant::now();
        let res = self.create_inner(data).await;
        record(Op::Create, res.is_err(), started);
        info!(kind = K::KIND, id = ?data.id.as_ref().map(Identity::to_string), ok = res.is_ok(), took_ms = %started.elapsed().as_millis(), "lifecycle: create done");
        res
    }

    async fn create_inner(&self, data: &mut ResourceData) -> Result<()> {
        let desired = normalize(&data.config, None, K::schema());
        let mut obj = K::expand(&desired)?;
        let meta = obj.metadata_mut();
        let namespace = match meta.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns.to_string(),
            _ => {
                meta.namespace = Some(self.config.default_namespace.clone());
                self.config.default_namespace.clone()
            }
        };
        info!(kind = K::KIND, namespace = %namespace, name = ?meta.name, "lifecycle: create start");
        let created = self.api.create(&namespace, &obj).await?;
        let created_meta = created.metadata();
        let id = Identity::from_parts(created_meta.namespace.as_deref().or(Some(namespace.as_str())), created_meta.name.as_deref())?;
        info!(kind = K::KIND, id = %id, "lifecycle: create submitted");
        data.id = Some(id.clone());
        data.config = desired;
        self.converge(&id, self.config.create_timeout).await?;
        self.read_inner(data).await
    }

    pub async fn read(&self, data: &mut ResourceData) -> Result<()> {
        let started = Instant::now();
        let res = self.read_inner(data).await;
        record(Op::Read, res.is_err(), started);
        res
    }

    async fn read_inner(&self, data: &mut ResourceData) -> Result<()> {
        let id = data.identity()?.clone();
        info!(kind = K::KIND, id = %id, "lifecycle: read");
        let obj = self.api.get(id.namespace(), id.name()).await?;
        data.config = K::flatten(&obj, &data.config);
        debug!(kind = K::KIND, id = %id, "lifecycle: read flattened");
        Ok(())
    }

    /// Move the resource from `data.config` to `new`.
    pub async fn update(&self, data: &mut ResourceData, new: &Tree) -> Result<()> {
        let started = Instant::now();
        let res = self.update_inner(data, new).await;
        record(Op::Update, res.is_err(), started);
        info!(kind = K::KIND, ok = res.is_ok(), took_ms = %started.elapsed().as_millis(), "lifecycle: update done");
        res
    }

    async fn update_inner(&self, data: &mut ResourceData, new: &Tree) -> Result<()> {
        let id = data.identity()?.clone();
        let desired = normalize(new, Some(&data.config), K::schema());
        let mut ops = diff::<K>(&data.config, &desired)?;
        if adds_whole_map(&ops, K::mutable_paths()) {
            let live = serde_json::to_value(self.api.get(id.namespace(), id.name()).await?)?;
            ops = rebase_map_adds(ops, K::mutable_paths(), &live);
        }
        if ops.is_empty() {
            info!(kind = K::KIND, id = %id, "lifecycle: update has no changes");
        } else {
            info!(kind = K::KIND, id = %id, ops = ops.len(), "lifecycle: update patch");
            self.api.patch(id.namespace(), id.name(), &ops.to_bytes()?).await?;
        }
        data.config = desired;
        self.converge(&id, self.config.update_timeout).await?;
        self.read_inner(data).await
    }

    pub async fn delete(&self, data: &mut ResourceData) -> Result<()> {
        let started = Instant::now();
        let res = self.delete_inner(data).await;
        record(Op::Delete, res.is_err(), started);
        info!(kind = K::KIND, ok = res.is_ok(), took_ms = %started.elapsed().as_millis(), "lifecycle: delete done");
        res
    }

    async fn delete_inner(&self, data: &mut ResourceData) -> Result<()> {
        let id = data.identity()?.clone();
        if let Some(drain) = K::drain_patch()? {
            info!(kind = K::KIND, id = %id, "lifecycle: draining before delete");
            self.api.patch(id.namespace(), id.name(), &drain.to_bytes()?).await?;
            self.converge(&id, self.config.delete_timeout).await?;
        }
        info!(kind = K::KIND, id = %id, propagation = ?K::PROPAGATION, "lifecycle: delete");
        self.api.delete(id.namespace(), id.name(), K::PROPAGATION).await?;
        data.id = None;
        Ok(())
    }

    /// Three-valued existence check. A record without identity is absent.
    pub async fn probe(&self, data: &ResourceData) -> Existence {
        let started = Instant::now();
        let Some(id) = data.id.as_ref() else { return Existence::Absent };
        info!(kind = K::KIND, id = %id, "lifecycle: exists");
        let out = match self.api.get(id.namespace(), id.name()).await {
            Ok(_) => Existence::Present,
            Err(e) if e.is_not_found() => Existence::Absent,
            Err(e) => {
                warn!(kind = K::KIND, id = %id, error = %e, "lifecycle: existence unknown; assuming present");
                Existence::Unknown(e)
            }
        };
        record(Op::Exists, matches!(out, Existence::Unknown(_)), started);
        out
    }

    pub async fn exists(&self, data: &ResourceData) -> (bool, Option<Error>) {
        self.probe(data).await.into_compat()
    }

    async fn converge(&self, id: &Identity, timeout: Duration) -> Result<()> {
        let what = format!("{} {}", K::KIND, id);
        wait_for_convergence(
            &what,
            || self.api.get(id.namespace(), id.name()),
            |obj: &K::Object| K::progress(obj).unwrap_or(Progress::new(0, 0)),
            self.config.wait_options(timeout),
        )
        .await
        .map(|_| ())
    }
}
