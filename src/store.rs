//! The value-store capability interface and the in-memory backend
//!
//! A store keeps three things per identity: annotations (free-form keys),
//! transform metadata (keys under the reserved `transform_` prefix, living in
//! the same flat attribute map), and zero or more named sample buffers. The
//! same trait is implemented by the ephemeral [`MemoryStore`] here and the
//! durable [`FileStore`](crate::file_store::FileStore).
//!
//! Mutating calls on a read-only store are no-ops that return `Ok(false)`;
//! `Err` is reserved for I/O and encoding failures.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::annotations::{check_annotations, Annotations, TRANSFORM_PREFIX};
use crate::error::{LineageError, Result};
use crate::waveform::Waveform;

/// Default name for an identity's primary sample buffer.
pub const WAVEFORM_DATA: &str = "waveform";

/// Key under which a node's parent identity list is stored.
pub const PARENTS_KEY: &str = "transform_parents";

/// An opaque identity naming one node in the lineage graph. Issued once,
/// never reused, never mutated.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Id(pub u64);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything persisted for one identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Record {
    /// Flat attribute map; transform metadata uses the reserved prefix.
    pub attrs: Annotations,
    /// Named sample buffers.
    pub data: BTreeMap<String, Waveform>,
}

/// Capability interface shared by every store backend.
pub trait SoundStore {
    /// A fresh, process-unique identity.
    fn new_id(&mut self) -> Result<Id>;

    fn read_only(&self) -> bool;

    fn contains(&self, id: Id) -> Result<bool>;

    /// Merge validated annotations into the identity's attributes.
    fn put_annotations(&mut self, id: Id, annotations: &Annotations) -> Result<bool>;

    /// The identity's annotations; empty when absent.
    fn get_annotations(&self, id: Id) -> Result<Annotations>;

    /// Merge transform metadata (all keys must carry the reserved prefix).
    fn put_metadata(&mut self, id: Id, metadata: &Annotations) -> Result<bool>;

    /// The identity's transform metadata (prefixed keys); empty when absent.
    fn get_metadata(&self, id: Id) -> Result<Annotations>;

    fn put_data(&mut self, id: Id, name: &str, wave: &Waveform, overwrite: bool) -> Result<bool>;

    fn get_data(&self, id: Id, name: &str) -> Result<Option<Waveform>>;

    /// Identities whose attributes contain every key/value pair of `query`.
    /// Linear scan.
    fn filter_ids(&self, query: &Annotations, limit: Option<usize>) -> Result<Vec<Id>>;

    /// Identities whose attributes satisfy an arbitrary predicate.
    fn filter_ids_by(
        &self,
        predicate: &dyn Fn(&Annotations) -> bool,
        limit: Option<usize>,
    ) -> Result<Vec<Id>>;

    fn list_ids(&self) -> Result<Vec<Id>>;

    /// Identities whose stored parent list is empty.
    fn list_roots(&self) -> Result<Vec<Id>> {
        self.filter_ids_by(
            &|attrs| {
                matches!(attrs.get(PARENTS_KEY),
                    Some(crate::annotations::AnnotationValue::List(parents)) if parents.is_empty())
            },
            None,
        )
    }
}

fn check_metadata_keys(metadata: &Annotations) -> Result<()> {
    for key in metadata.keys() {
        if !key.starts_with(TRANSFORM_PREFIX) {
            return Err(LineageError::Encoding(format!(
                "transform metadata key {:?} lacks the {:?} prefix",
                key, TRANSFORM_PREFIX
            )));
        }
    }
    Ok(())
}

pub(crate) fn split_annotations(attrs: &Annotations) -> Annotations {
    attrs
        .iter()
        .filter(|(k, _)| !k.starts_with(TRANSFORM_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub(crate) fn split_metadata(attrs: &Annotations) -> Annotations {
    attrs
        .iter()
        .filter(|(k, _)| k.starts_with(TRANSFORM_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub(crate) fn matches_query(attrs: &Annotations, query: &Annotations) -> bool {
    query
        .iter()
        .all(|(key, value)| attrs.get(key) == Some(value))
}

/// Ephemeral map-backed store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: HashMap<Id, Record>,
    next_id: u64,
    read_only: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }
}

impl SoundStore for MemoryStore {
    fn new_id(&mut self) -> Result<Id> {
        let id = Id(self.next_id);
        self.next_id += 1;
        Ok(id)
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn contains(&self, id: Id) -> Result<bool> {
        Ok(self.records.contains_key(&id))
    }

    fn put_annotations(&mut self, id: Id, annotations: &Annotations) -> Result<bool> {
        check_annotations(annotations)?;
        if self.read_only {
            return Ok(false);
        }
        let record = self.records.entry(id).or_default();
        for (key, value) in annotations {
            record.attrs.insert(key.clone(), value.clone());
        }
        Ok(true)
    }

    fn get_annotations(&self, id: Id) -> Result<Annotations> {
        Ok(self
            .records
            .get(&id)
            .map(|r| split_annotations(&r.attrs))
            .unwrap_or_default())
    }

    fn put_metadata(&mut self, id: Id, metadata: &Annotations) -> Result<bool> {
        check_metadata_keys(metadata)?;
        if self.read_only {
            return Ok(false);
        }
        let record = self.records.entry(id).or_default();
        for (key, value) in metadata {
            record.attrs.insert(key.clone(), value.clone());
        }
        Ok(true)
    }

    fn get_metadata(&self, id: Id) -> Result<Annotations> {
        Ok(self
            .records
            .get(&id)
            .map(|r| split_metadata(&r.attrs))
            .unwrap_or_default())
    }

    fn put_data(&mut self, id: Id, name: &str, wave: &Waveform, overwrite: bool) -> Result<bool> {
        if self.read_only {
            return Ok(false);
        }
        let record = self.records.entry(id).or_default();
        if !overwrite && record.data.contains_key(name) {
            return Ok(false);
        }
        record.data.insert(name.to_string(), wave.clone());
        Ok(true)
    }

    fn get_data(&self, id: Id, name: &str) -> Result<Option<Waveform>> {
        Ok(self
            .records
            .get(&id)
            .and_then(|r| r.data.get(name))
            .cloned())
    }

    fn filter_ids(&self, query: &Annotations, limit: Option<usize>) -> Result<Vec<Id>> {
        self.filter_ids_by(&|attrs| matches_query(attrs, query), limit)
    }

    fn filter_ids_by(
        &self,
        predicate: &dyn Fn(&Annotations) -> bool,
        limit: Option<usize>,
    ) -> Result<Vec<Id>> {
        let mut ids: Vec<Id> = self.records.keys().copied().collect();
        ids.sort();
        let mut matched = Vec::new();
        for id in ids {
            if predicate(&self.records[&id].attrs) {
                matched.push(id);
                if limit.is_some_and(|n| matched.len() >= n) {
                    break;
                }
            }
        }
        Ok(matched)
    }

    fn list_ids(&self) -> Result<Vec<Id>> {
        let mut ids: Vec<Id> = self.records.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}
