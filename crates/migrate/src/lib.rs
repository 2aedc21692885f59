//! kform migrate: upgrade persisted records written under older schema
//! versions, one registered `v -> v+1` step at a time.

#![forbid(unsafe_code)]

use kform_core::{Attributes, Error, Result, StateRecord};
use metrics::counter;
use tracing::{debug, info};

/// One pure `v -> v+1` transformation over a record's attributes.
pub type Step = fn(&mut Attributes);

/// Ordered step registry for one resource kind. `steps[v]` upgrades `v` to `v+1`.
#[derive(Debug, Clone, Copy)]
pub struct Migrator {
    kind: &'static str,
    steps: &'static [Step],
}

impl Migrator {
    pub const fn new(kind: &'static str, steps: &'static [Step]) -> Self {
        Self { kind, steps }
    }

    /// Current schema version of the kind.
    pub fn latest(&self) -> u32 {
        self.steps.len() as u32
    }

    /// Apply every step from `from` up to the latest version.
    pub fn migrate(&self, mut attrs: Attributes, from: u32) -> Result<Attributes> {
        if attrs.is_empty() {
            debug!(kind = self.kind, "empty state; nothing to migrate");
            return Ok(attrs);
        }
        let latest = self.latest();
        if from > latest {
            return Err(Error::UnknownVersion { kind: self.kind, found: from, latest });
        }
        for (v, step) in self.steps.iter().enumerate().skip(from as usize) {
            info!(kind = self.kind, from = v, to = v + 1, "migrating state");
            debug!(kind = self.kind, attrs = ?attrs, "attributes before migration");
            step(&mut attrs);
            debug!(kind = self.kind, attrs = ?attrs, "attributes after migration");
            counter!("migrate_steps_total", 1u64);
        }
        Ok(attrs)
    }

    /// Migrate a whole record and stamp it with the latest version.
    pub fn migrate_record(&self, record: StateRecord) -> Result<StateRecord> {
        if record.is_empty() {
            return Ok(record);
        }
        let attributes = self.migrate(record.attributes, record.schema_version)?;
        Ok(StateRecord { id: record.id, schema_version: self.latest(), attributes })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rename {
    Moved,
    /// Destination already held a value; the source was dropped.
    Kept,
    Missing,
}

/// Move `from` to `to` without clobbering an existing destination value.
/// The source key is removed in every case so a value never lives at both.
pub fn rename(attrs: &mut Attributes, from: &str, to: &str) -> Rename {
    let Some(v) = attrs.remove(from) else { return Rename::Missing };
    if attrs.get(to).is_some_and(|existing| !existing.is_empty()) {
        debug!(from, to, "destination already set; dropping source");
        return Rename::Kept;
    }
    debug!(from, to, "moved attribute");
    attrs.insert(to.to_string(), v);
    Rename::Moved
}

/// Insert a default for a newly introduced field unless one is already set.
pub fn insert_default(attrs: &mut Attributes, key: &str, value: impl Into<String>) -> bool {
    if attrs.contains_key(key) {
        return false;
    }
    attrs.insert(key.to_string(), value.into());
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn add_a(a: &mut Attributes) {
        insert_default(a, "a", "1");
    }

    fn move_a_to_b(a: &mut Attributes) {
        rename(a, "a", "b");
    }

    const STEPS: &[Step] = &[add_a, move_a_to_b];
    const M: Migrator = Migrator::new("thing", STEPS);

    #[test]
    fn runs_steps_from_stamped_version() {
        let out = M.migrate(attrs(&[("x", "y")]), 0).unwrap();
        assert_eq!(out, attrs(&[("x", "y"), ("b", "1")]));
        let out = M.migrate(attrs(&[("a", "9")]), 1).unwrap();
        assert_eq!(out, attrs(&[("b", "9")]));
    }

    #[test]
    fn latest_version_is_noop() {
        let input = attrs(&[("a", "1"), ("k", "v")]);
        assert_eq!(M.migrate(input.clone(), M.latest()).unwrap(), input);
    }

    #[test]
    fn newer_version_is_rejected() {
        let err = M.migrate(attrs(&[("k", "v")]), 3).unwrap_err();
        assert!(matches!(err, Error::UnknownVersion { found: 3, latest: 2, .. }));
    }

    #[test]
    fn empty_record_short_circuits_any_version() {
        assert!(M.migrate(Attributes::new(), 99).unwrap().is_empty());
        let rec = StateRecord { id: String::new(), schema_version: 99, attributes: Attributes::new() };
        assert_eq!(M.migrate_record(rec.clone()).unwrap(), rec);
    }

    #[test]
    fn rename_never_clobbers() {
        let mut a = attrs(&[("old", "1"), ("new", "2")]);
        assert_eq!(rename(&mut a, "old", "new"), Rename::Kept);
        assert_eq!(a, attrs(&[("new", "2")]));
        assert_eq!(rename(&mut a, "old", "new"), Rename::Missing);
    }

    #[test]
    fn record_is_restamped() {
        let rec = StateRecord { id: "ns/x".into(), schema_version: 0, attributes: attrs(&[("k", "v")]) };
        let out = M.migrate_record(rec).unwrap();
        assert_eq!(out.schema_version, 2);
        assert_eq!(out.id, "ns/x");
    }
}
